#[macro_use]
extern crate log;

use colored::Colorize;
use env_logger::Env;

use lightbox::config;
use lightbox::dataset::{DatasetType, Payload, ReadOptions};
use lightbox::project::DataProject;
use lightbox::splash::SplashClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("lightbox=info")).init();

    info!("🔦 lightbox v{}", VERSION);

    let (config, free) = config::load_config_with_args()?;
    let command = free.first().map(|s| s.as_str()).unwrap_or("browse");

    match command {
        "browse" => {
            let template = free.get(1).map(|s| s.as_str()).unwrap_or("*");
            let selected: Vec<String> = free.iter().skip(2).cloned().collect();

            let mut project =
                DataProject::new(config.data_type, &config.root_uri, config.api_key.clone());
            project.datasets = project.browse(template, &selected).await?;

            for dataset in &project.datasets {
                let count = match dataset {
                    DatasetType::File(d) => d.filenames.len().to_string(),
                    DatasetType::Tiled(_) => "?".to_string(),
                };
                println!("{:>8}  {}", count.yellow(), dataset.uri().blue());
            }
            println!(
                "{} datasets, {} elements",
                project.datasets.len(),
                project.total()
            );

            project.save(&config.project_file)?;
            info!("project saved to {:?}", config.project_file);
        }

        "import" => {
            let project_id = free
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("import requires a PROJECT_ID"))?;
            let splash_uri = config
                .splash_uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("no splash_uri configured"))?;

            let records = SplashClient::new(splash_uri)
                .project_datasets(project_id)
                .await?;

            let mut project =
                DataProject::new(config.data_type, &config.root_uri, config.api_key.clone());
            project.project_id = Some(project_id.clone());
            for record in &records {
                match serde_json::from_value::<DatasetType>(record.clone()) {
                    Ok(dataset) => project.datasets.push(dataset),
                    Err(e) => warn!("skipping record {}: {}", record, e),
                }
            }

            println!(
                "imported {} of {} records for project {}",
                project.datasets.len(),
                records.len(),
                project_id.green()
            );
            project.save(&config.project_file)?;
        }

        "read" => {
            let indices = parse_indices(&free[1..])?;
            let project = DataProject::load(&config.project_file)?;

            let (payloads, uris) = project.read(&indices, &ReadOptions::default()).await?;
            for ((index, payload), uri) in indices.iter().zip(payloads).zip(uris) {
                let shown = match payload {
                    Some(Payload::Encoded(s)) => format!("data uri, {} bytes", s.len()),
                    Some(Payload::Image(img)) => {
                        format!("image {}x{}", img.width(), img.height())
                    }
                    Some(Payload::Raw(block)) => {
                        format!("{} block {:?}", block.dtype(), block.shape())
                    }
                    None => "unavailable".red().to_string(),
                };
                println!(
                    "{:>8}  {}  {}",
                    index,
                    uri.as_deref().unwrap_or("-").blue(),
                    shown
                );
            }
        }

        "download" => {
            let indices = parse_indices(&free[1..])?;
            let project = DataProject::load(&config.project_file)?;

            let paths = project
                .materialize(&config.download_dir, &indices)
                .await?;
            for path in paths {
                println!("{}", path.display());
            }
        }

        other => {
            anyhow::bail!("unknown command: {} (see --help)", other);
        }
    }

    Ok(())
}

fn parse_indices(args: &[String]) -> anyhow::Result<Vec<usize>> {
    if args.is_empty() {
        anyhow::bail!("no indices given");
    }
    args.iter()
        .map(|a| {
            a.parse::<usize>()
                .map_err(|e| anyhow::anyhow!("bad index {}: {}", a, e))
        })
        .collect()
}

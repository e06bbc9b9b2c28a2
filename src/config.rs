use std::env;
use std::path::PathBuf;

use getopts::Options;
use serde::Deserialize;

use crate::project::DataKind;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Data root: a directory for file projects, the service endpoint for
    /// tiled projects.
    pub root_uri: String,
    pub data_type: DataKind,
    pub api_key: Option<String>,
    /// Tagging/event collaborator endpoint.
    pub splash_uri: Option<String>,
    /// Where the project description is persisted between invocations.
    pub project_file: PathBuf,
    /// Target root for materialized remote elements.
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_uri: "data/".into(),
            data_type: DataKind::File,
            api_key: None,
            splash_uri: None,
            project_file: "./project.json".into(),
            download_dir: "data/".into(),
        }
    }
}

/// Read `lightbox.toml` (or an explicit `-c` file) and apply command line
/// overrides on top. Returns the remaining free arguments (subcommand and
/// its parameters).
pub fn load_config_with_args() -> anyhow::Result<(Config, Vec<String>)> {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt(
        "c",
        "config",
        "configuration file (default: ./lightbox.toml)",
        "FILE",
    );
    opts.optopt("u", "uri", "data root (directory or tiled endpoint)", "URI");
    opts.optopt("t", "type", "backend kind: file or tiled", "KIND");
    opts.optopt("k", "api-key", "tiled api key", "KEY");
    opts.optopt(
        "p",
        "project",
        "project description file (default: ./project.json)",
        "FILE",
    );
    opts.optopt("d", "download-dir", "target root for downloads", "DIR");
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => panic!("{}", f),
    };

    if matches.opt_present("h") {
        let brief = format!("Usage: {} [options] COMMAND [args..]", program);
        print!("{}", opts.usage(&brief));
        println!(
            r#"
Commands:
  browse [TEMPLATE] [SUB_URI..]   discover datasets under the root and save
                                  the project description
  import PROJECT_ID               rebuild the project from stored records
  read INDEX..                    read elements by global index
  download INDEX..                materialize remote elements to disk

TEMPLATE is a format filter for file roots (e.g. "*.tif", "*") or a
sub-path query for tiled roots."#
        );
        return Err(anyhow::anyhow!("argument help"));
    }

    let mut config = if let Some(f) = matches.opt_get::<PathBuf>("config")? {
        info!("reading configuration from: {:?}", f);
        let config = std::fs::read_to_string(f)?;
        toml::from_str(&config)?
    } else if std::fs::metadata("./lightbox.toml").is_ok() {
        info!("reading configuration from default: ./lightbox.toml");
        let config = std::fs::read_to_string("./lightbox.toml")?;
        toml::from_str(&config)?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    // Override configuration options with arguments
    if let Some(u) = matches.opt_str("u") {
        config.root_uri = u;
    }
    if let Some(t) = matches.opt_str("t") {
        config.data_type = t.parse()?;
    }
    if let Some(k) = matches.opt_str("k") {
        config.api_key = Some(k);
    }
    matches
        .opt_get::<PathBuf>("p")?
        .into_iter()
        .for_each(|p| config.project_file = p);
    matches
        .opt_get::<PathBuf>("d")?
        .into_iter()
        .for_each(|d| config.download_dir = d);

    Ok((config, matches.free))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let config: Config = toml::from_str(
            r#"
            root_uri = "http://tiled:8000"
            data_type = "tiled"
            api_key = "secret"
            project_file = "p.json"
            download_dir = "/tmp/out"
            "#,
        )
        .unwrap();

        assert_eq!(config.root_uri, "http://tiled:8000");
        assert_eq!(config.data_type, DataKind::Tiled);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.download_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn kind_parse() {
        assert_eq!("file".parse::<DataKind>().unwrap(), DataKind::File);
        assert_eq!("tiled".parse::<DataKind>().unwrap(), DataKind::Tiled);
        assert!("zarr".parse::<DataKind>().is_err());
    }
}

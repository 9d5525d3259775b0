//! Configuration related structures
use anyhow::{Result, bail};
use clap::Parser;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;

macro_rules! prefix {
    () => {
        "SPLAYD_"
    };
}

#[derive(CopyGetters, Debug, Getters, Parser)]
#[command(
    about = "A multi-worker event-driven server runtime.",
    after_help("Connections are accepted on one listening socket and spread round-robin across a fixed pool of worker reactors."),
    disable_help_flag = true
)]
pub struct Config {
    #[arg(long("help"), action = clap::ArgAction::HelpLong)]
    /// Print help.
    help: Option<bool>,

    #[get_copy = "pub"]
    #[arg(long("version"), short('v'))]
    /// Show version information.
    version: bool,

    #[get = "pub"]
    #[arg(
        default_value("info"),
        env(concat!(prefix!(), "LOG_LEVEL")),
        long("log-level"),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the server.
    log_level: String,

    #[get_copy = "pub"]
    #[arg(
        default_value("8080"),
        env(concat!(prefix!(), "PORT")),
        long("port"),
        short('p'),
        value_name("PORT")
    )]
    /// Port of the listening socket.
    port: u16,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "WORKERS")),
        long("workers"),
        short('c'),
        value_name("COUNT")
    )]
    /// Number of worker reactors; defaults to the logical CPU count, or
    /// one in CLI mode.
    workers: Option<u32>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "HOST")),
        long("host"),
        short('h'),
        value_name("ADDRESS")
    )]
    /// Bind address; defaults to 0.0.0.0, or :: with --6.
    host: Option<String>,

    #[get_copy = "pub"]
    #[arg(long("6"))]
    /// Bind an IPv6 listening socket.
    ipv6: bool,

    #[get = "pub"]
    #[arg(
        default_value("localhost"),
        env(concat!(prefix!(), "NODE")),
        long("node"),
        short('n'),
        value_name("NAME")
    )]
    /// Node name handed to handlers.
    node: String,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "MODULES")),
        long("modules"),
        short('m'),
        value_delimiter(','),
        value_name("PATHS")
    )]
    /// Comma separated extension module paths.
    modules: Vec<PathBuf>,

    #[get_copy = "pub"]
    #[arg(long("cli"))]
    /// Run without a listening socket.
    cli: bool,

    #[get_copy = "pub"]
    #[arg(long("cfg"))]
    /// Print the resolved configuration and continue.
    show_config: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("4"),
        env(concat!(prefix!(), "ACCEPT_BACKLOG_PER_WORKER")),
        long("accept-backlog-per-worker"),
        value_name("COUNT")
    )]
    /// Accepts pre-posted per worker under the IOCP backend.
    accept_backlog_per_worker: u32,

    #[get = "pub"]
    #[arg(value_name("ENTRYPOINT"))]
    /// Handler module path; the built-in HTTP application when absent.
    entrypoint: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}

impl Config {
    /// Validate the configuration integrity.
    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            bail!("at least one worker is required")
        }
        if self.accept_backlog_per_worker == 0 {
            bail!("at least one pre-posted accept per worker is required")
        }
        for path in &self.modules {
            if !path.exists() {
                bail!("module path '{}' does not exist", path.display())
            }
        }
        if let Some(entrypoint) = &self.entrypoint {
            if !entrypoint.exists() {
                bail!("entrypoint '{}' does not exist", entrypoint.display())
            }
        }
        Ok(())
    }

    /// The resolved worker count.
    pub fn worker_count(&self) -> u32 {
        match self.workers {
            Some(count) => count.max(1),
            None if self.cli => 1,
            None => num_cpus::get().max(1) as u32,
        }
    }

    /// The resolved bind address.
    pub fn bind_host(&self) -> &str {
        match &self.host {
            Some(host) => host,
            None if self.ipv6 => "::",
            None => "0.0.0.0",
        }
    }

    /// The `--cfg` dump, written before startup continues.
    pub fn print(&self) {
        println!("Name: {}", self.node());
        println!("Concurrency: {}", self.worker_count());
        println!("Address: {}", self.bind_host());
        println!("Port: {}", self.port());
        println!("IPv6: {}", if self.ipv6() { "yes" } else { "no" });
        println!("CLI: {}", if self.cli() { "yes" } else { "no" });
        match self.entrypoint() {
            Some(path) => println!("Entrypoint: {}", path.display()),
            None => println!("Entrypoint: built-in httpd"),
        }
        if self.modules().is_empty() {
            println!("Modules: no modules");
        } else {
            let joined: Vec<String> = self
                .modules()
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            println!("Modules: {}", joined.join(","));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("splayd").chain(args.iter().copied()))
            .expect("parse args")
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = parse(&[]);
        assert_eq!(config.port(), 8080);
        assert_eq!(config.node(), "localhost");
        assert_eq!(config.bind_host(), "0.0.0.0");
        assert!(!config.ipv6());
        assert!(!config.cli());
        assert!(config.modules().is_empty());
        assert!(config.worker_count() >= 1);
        assert_eq!(config.accept_backlog_per_worker(), 4);
    }

    #[test]
    fn short_flags_parse() {
        let config = parse(&["-p", "9000", "-c", "3", "-n", "edge-1", "-h", "127.0.0.1"]);
        assert_eq!(config.port(), 9000);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.node(), "edge-1");
        assert_eq!(config.bind_host(), "127.0.0.1");
    }

    #[test]
    fn ipv6_switches_the_default_bind_address() {
        let config = parse(&["--6"]);
        assert!(config.ipv6());
        assert_eq!(config.bind_host(), "::");
    }

    #[test]
    fn cli_mode_defaults_to_one_worker() {
        let config = parse(&["--cli"]);
        assert_eq!(config.worker_count(), 1);
        let config = parse(&["--cli", "-c", "4"]);
        assert_eq!(config.worker_count(), 4);
    }

    #[test]
    fn module_list_splits_on_commas() {
        let config = parse(&["-m", "a.so,b.so"]);
        assert_eq!(
            config.modules(),
            &vec![PathBuf::from("a.so"), PathBuf::from("b.so")]
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = parse(&["-c", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_module_paths_fail_validation() {
        let config = parse(&["-m", "/definitely/not/here.so"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn existing_module_paths_validate() {
        let module = tempfile::NamedTempFile::new().expect("temp module");
        let path = module.path().display().to_string();
        let config = parse(&["-m", &path]);
        assert!(config.validate().is_ok());
    }
}

use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc;

use clap;
// Set up human-panic for release build
#[cfg(not(debug_assertions))]
use human_panic::setup_panic;
use log::LevelFilter;
use log::*;
use log4rs::append::console::ConsoleAppender;
#[cfg(not(debug_assertions))]
use log4rs::append::rolling_file::{self, RollingFileAppender};
#[cfg(not(debug_assertions))]
use log4rs::config::Logger;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

use imxup::cli::{self, Cli};
use imxup::config::constants as c;
use imxup::config::Config;
use imxup::{self as ix, Agent};

///////////////////////////////////////////////////////////////////////////////
//
// --------------------
// Environment variables
// --------------------
//
// - IMXUP_LOG_LEVEL=(debug|info|warn|error)?
//
//   Specify the debug-build console logging level (case-insensitive).
//   If omitted, "warn" will be used.
//
///////////////////////////////////////////////////////////////////////////////

/// A context for the CLI.
struct Context {
    config: Option<Config>, // Empty until `get_config()` is called
    cli: Option<Cli>,       // Empty until `get_cli()` is called
}

impl Context {
    fn new() -> Self {
        Self {
            config: None,
            cli: None,
        }
    }

    /// Lazily reads the `imxup.ini` file in the imxup home directory,
    /// returning a typed representation. A missing file yields defaults.
    fn get_config(&mut self) -> Config {
        match self.config {
            Some(ref config) => config.clone(),
            None => {
                let config = Config::from_config_file_or_default();
                self.config = Some(config.clone());
                config
            }
        }
    }

    /// Lazily builds the one-shot CLI context (database + scan worker).
    fn get_cli(&mut self) -> ix::Result<&Cli> {
        if self.cli.is_none() {
            let config = self.get_config();
            self.cli = Some(Cli::new(config)?);
        }
        Ok(self.cli.as_ref().expect("just constructed"))
    }

    fn finish(self) {
        if let Some(cli) = self.cli {
            cli.finish();
        }
    }

    /// Sets up logging.
    fn setup_logging() -> ix::Result<()> {
        // Get log level from the environment, falling back to the default.
        fn get_log_level(default_level: LevelFilter) -> LevelFilter {
            if let Ok(loglevel) = env::var("IMXUP_LOG_LEVEL").or_else(|_| env::var("LOGLEVEL")) {
                match loglevel.to_lowercase().as_str() {
                    "debug" => LevelFilter::Debug,
                    "info" => LevelFilter::Info,
                    "warn" => LevelFilter::Warn,
                    "error" => LevelFilter::Error,
                    level => {
                        eprintln!("not a valid logging level: {}", level);
                        default_level
                    }
                }
            } else {
                default_level
            }
        }

        // === DEBUG BUILD ====================================================
        #[cfg(debug_assertions)]
        let config: LogConfig = {
            let stdout = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(c::AGENT_LOG_FORMAT)))
                .build();

            LogConfig::builder()
                .appender(Appender::builder().build("stdout", Box::new(stdout)))
                .build(
                    Root::builder()
                        .appender("stdout")
                        .build(get_log_level(LevelFilter::Info)),
                )
                .expect("ix:main:logging:init ~ couldn't initialize the console logger")
        };

        // === RELEASE BUILD ==================================================
        #[cfg(not(debug_assertions))]
        let config: LogConfig = {
            let mut log_path = PathBuf::from(
                ix::logs_dir().expect("ix:main:logging:init ~ couldn't get the log directory"),
            );
            std::fs::create_dir_all(&log_path)
                .expect("ix:main:logging:init ~ couldn't create the log directory");
            log_path.push("imxup");
            log_path.set_extension("log");

            let trigger = rolling_file::policy::compound::trigger::size::SizeTrigger::new(
                c::LOG_MAX_BYTES,
            );
            let roller =
                rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller::builder()
                    .base(1)
                    .build(
                        &format!("{}{{}}", log_path.to_string_lossy()),
                        c::LOG_ROTATION_COUNT,
                    )
                    .expect("ix:main:logging:init ~ couldn't initialize logger");
            let policy = rolling_file::policy::compound::CompoundPolicy::new(
                Box::new(trigger),
                Box::new(roller),
            );

            let file = RollingFileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(c::AGENT_LOG_FORMAT)))
                .build(&log_path, Box::new(policy))
                .expect("ix:main:logging:init ~ couldn't build the file logger");
            let stdout = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(c::AGENT_LOG_FORMAT)))
                .build();

            LogConfig::builder()
                .appender(Appender::builder().build("rolling_file", Box::new(file)))
                .appender(Appender::builder().build("stdout", Box::new(stdout)))
                .logger(
                    Logger::builder()
                        .appender("rolling_file")
                        .additive(false)
                        .build("imxup", get_log_level(LevelFilter::Info)),
                )
                .build(
                    Root::builder()
                        .appender("stdout")
                        .build(get_log_level(LevelFilter::Warn)),
                )
                .expect("ix:main:logging:init ~ couldn't build the console logger")
        };

        log4rs::init_config(config).map(|_| ()).map_err(Into::into)
    }
}

/// Runs the agent in server mode until SIGINT.
fn run_server(config: &Config) -> ix::Result<()> {
    let handle = Agent::new().start(config)?;
    println!("imxup agent running; press ctrl-c to stop");

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("received SIGINT");
        let _ = tx.send(());
    })
    .expect("couldn't install SIGINT handler");

    let _ = rx.recv();
    println!("Shutting down");
    handle.shutdown();
    Ok(())
}

/// Function to validate if a folder exists.
fn folder_exists<S: Into<String>>(path: S) -> Result<(), String> {
    let path = path.into();
    if !PathBuf::from(path.clone()).is_dir() {
        Err(format!("folder not found: {:?}", path))
    } else {
        Ok(())
    }
}

#[allow(clippy::cyclomatic_complexity)]
fn main() {
    // First, initialize all logging:
    Context::setup_logging().expect("couldn't initialize the logger");

    // Set up human-panic for release build
    #[cfg(not(debug_assertions))]
    setup_panic!();

    let mut context = Context::new();

    let mut app = clap::App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Durable multi-destination gallery upload agent")
        .setting(clap::AppSettings::UnifiedHelpMessage)
        .subcommand(
            clap::SubCommand::with_name("server")
                .about("Run the agent: scanner, upload engine, file-host and rename workers")
                .long_about(
                    "Run the agent until interrupted. The engine uploads queued galleries, \
                     file-host workers drain pending archive uploads, and the rename worker \
                     retries pending renames.",
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("add")
                .about("Add gallery folders to the queue")
                .arg(
                    clap::Arg::with_name("paths")
                        .value_name("paths")
                        .takes_value(true)
                        .multiple(true)
                        .min_values(1)
                        .required(true)
                        .validator(folder_exists)
                        .help("Folders of images; each becomes one gallery"),
                )
                .arg(
                    clap::Arg::with_name("template")
                        .long("template")
                        .value_name("template")
                        .takes_value(true)
                        .help("BBCode template name for the completion artifacts"),
                )
                .arg(
                    clap::Arg::with_name("tab")
                        .long("tab")
                        .value_name("tab")
                        .takes_value(true)
                        .help("Tab the galleries are grouped under (default: Main)"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("start")
                .about("Queue galleries for upload")
                .arg(
                    clap::Arg::with_name("paths")
                        .value_name("paths")
                        .takes_value(true)
                        .multiple(true)
                        .help("Gallery folders to queue"),
                )
                .arg(
                    clap::Arg::with_name("all")
                        .long("all")
                        .help("Queue every startable gallery"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("queue")
                .about("Show the gallery queue")
                .alias("q"),
        )
        .subcommand(clap::SubCommand::with_name("tabs").about("List tabs"))
        .subcommand(
            clap::SubCommand::with_name("retry")
                .about("Retry a failed upload (resumes when progress exists)")
                .arg(
                    clap::Arg::with_name("path")
                        .value_name("path")
                        .takes_value(true)
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("remove")
                .about("Remove a gallery from the queue")
                .arg(
                    clap::Arg::with_name("path")
                        .value_name("path")
                        .takes_value(true)
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("rescan")
                .about("Rescan a gallery folder, keeping upload progress")
                .arg(
                    clap::Arg::with_name("path")
                        .value_name("path")
                        .takes_value(true)
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("reset")
                .about("Reset a gallery completely and rescan it")
                .arg(
                    clap::Arg::with_name("path")
                        .value_name("path")
                        .takes_value(true)
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("archive")
                .about("Move old completed galleries to the Archive tab"),
        )
        .subcommand(
            clap::SubCommand::with_name("unnamed")
                .about("List galleries whose host rename is still pending"),
        )
        .subcommand(
            clap::SubCommand::with_name("hosts")
                .about("Show file-host upload state")
                .arg(
                    clap::Arg::with_name("path")
                        .value_name("path")
                        .takes_value(true)
                        .index(1)
                        .help("Limit to one gallery folder"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("push")
                .about("Queue a gallery ZIP upload to a configured file host")
                .arg(
                    clap::Arg::with_name("path")
                        .value_name("path")
                        .takes_value(true)
                        .required(true)
                        .index(1),
                )
                .arg(
                    clap::Arg::with_name("host")
                        .value_name("host")
                        .takes_value(true)
                        .required(true)
                        .index(2),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("check")
                .about("Check which uploaded images are still online")
                .arg(
                    clap::Arg::with_name("paths")
                        .value_name("paths")
                        .takes_value(true)
                        .multiple(true)
                        .help("Limit the check to these galleries (default: all completed)"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("credentials")
                .about("Store credentials in the OS secret store")
                .subcommand(
                    clap::SubCommand::with_name("api-key")
                        .about("Store the primary-host API key")
                        .arg(
                            clap::Arg::with_name("key")
                                .value_name("key")
                                .takes_value(true)
                                .required(true)
                                .index(1),
                        ),
                )
                .subcommand(
                    clap::SubCommand::with_name("web-password")
                        .about("Store the web-session password used for renames")
                        .arg(
                            clap::Arg::with_name("password")
                                .value_name("password")
                                .takes_value(true)
                                .required(true)
                                .index(1),
                        ),
                )
                .subcommand(
                    clap::SubCommand::with_name("filehost")
                        .about("Store a file-host password")
                        .arg(
                            clap::Arg::with_name("host")
                                .value_name("host")
                                .takes_value(true)
                                .required(true)
                                .index(1),
                        )
                        .arg(
                            clap::Arg::with_name("password")
                                .value_name("password")
                                .takes_value(true)
                                .required(true)
                                .index(2),
                        ),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("config")
                .about("Configure the imxup agent")
                .subcommand(
                    clap::SubCommand::with_name("show").about("Show the resolved configuration"),
                )
                .subcommand(
                    clap::SubCommand::with_name("example")
                        .about("Print a template configuration file to standard output"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("version")
                .about("Print the current version number"),
        );

    // Get the raw argument count:
    let raw_arg_count = env::args().count();
    if raw_arg_count <= 1 {
        app.print_help().expect("couldn't print help");
        exit(1);
    }

    let matches = match app.get_matches_from_safe_borrow(&mut env::args()) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let outcome: ix::Result<()> = match matches.subcommand() {
        ("server", _) => {
            let config = context.get_config();
            run_server(&config)
        }
        ("add", Some(args)) => {
            let paths: Vec<String> = args
                .values_of("paths")
                .map(|p| p.map(String::from).collect())
                .unwrap_or_else(Vec::new);
            let template = args.value_of("template").map(String::from);
            let tab = args.value_of("tab").map(String::from);
            context
                .get_cli()
                .and_then(|cli| {
                    cli.add(&paths, template.as_deref(), tab.as_deref())
                        .map_err(Into::into)
                })
        }
        ("start", Some(args)) => {
            let paths: Vec<String> = args
                .values_of("paths")
                .map(|p| p.map(String::from).collect())
                .unwrap_or_else(Vec::new);
            let all = args.is_present("all");
            if paths.is_empty() && !all {
                eprintln!("Provide gallery paths or --all.");
                exit(1);
            }
            context
                .get_cli()
                .and_then(|cli| cli.start(&paths, all).map_err(Into::into))
        }
        ("queue", _) => context.get_cli().map(|cli| cli.print_queue()),
        ("tabs", _) => context
            .get_cli()
            .and_then(|cli| cli.print_tabs().map_err(Into::into)),
        ("retry", Some(args)) => {
            let path = args.value_of("path").unwrap().to_string();
            context
                .get_cli()
                .and_then(|cli| cli.retry(&path).map_err(Into::into))
        }
        ("remove", Some(args)) => {
            let path = args.value_of("path").unwrap().to_string();
            context
                .get_cli()
                .and_then(|cli| cli.remove(&path).map_err(Into::into))
        }
        ("rescan", Some(args)) => {
            let path = args.value_of("path").unwrap().to_string();
            context
                .get_cli()
                .and_then(|cli| cli.rescan(&path).map_err(Into::into))
        }
        ("reset", Some(args)) => {
            let path = args.value_of("path").unwrap().to_string();
            context
                .get_cli()
                .and_then(|cli| cli.reset(&path).map_err(Into::into))
        }
        ("archive", _) => context.get_cli().map(|cli| cli.archive_pass()),
        ("unnamed", _) => context
            .get_cli()
            .and_then(|cli| cli.print_unnamed().map_err(Into::into)),
        ("hosts", Some(args)) => {
            let path = args.value_of("path").map(String::from);
            context
                .get_cli()
                .and_then(|cli| cli.print_hosts(path.as_deref()).map_err(Into::into))
        }
        ("push", Some(args)) => {
            let path = args.value_of("path").unwrap().to_string();
            let host = args.value_of("host").unwrap().to_string();
            context
                .get_cli()
                .and_then(|cli| cli.push_to_host(&path, &host).map_err(Into::into))
        }
        ("check", Some(args)) => {
            let paths: Vec<String> = args
                .values_of("paths")
                .map(|p| p.map(String::from).collect())
                .unwrap_or_else(Vec::new);
            context
                .get_cli()
                .and_then(|cli| cli.check_status(&paths).map_err(Into::into))
        }
        ("credentials", Some(cred_matches)) => match cred_matches.subcommand() {
            ("api-key", Some(args)) => {
                cli::store_api_key(args.value_of("key").unwrap()).map_err(Into::into)
            }
            ("web-password", Some(args)) => {
                cli::store_web_password(args.value_of("password").unwrap()).map_err(Into::into)
            }
            ("filehost", Some(args)) => cli::store_filehost_password(
                args.value_of("host").unwrap(),
                args.value_of("password").unwrap(),
            )
            .map_err(Into::into),
            _ => {
                eprintln!("Run `imxup credentials --help` for the available entries.");
                exit(1);
            }
        },
        ("config", Some(config_matches)) => match config_matches.subcommand() {
            ("example", _) => {
                cli::print_config_example();
                Ok(())
            }
            _ => {
                let config = context.get_config();
                cli::print_config(&config);
                Ok(())
            }
        },
        ("version", _) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        _ => {
            println!(
                "\nRun `{} --help` for available options.\n",
                env!("CARGO_PKG_NAME")
            );
            Ok(())
        }
    };

    let code = match outcome {
        Ok(()) => 0,
        Err(e) => e.render(),
    };
    context.finish();
    exit(code);
}

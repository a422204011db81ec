mod client;
mod server;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Args as ClapArgs, Parser, Subcommand};
use flagstore_lib::proto::{
    list_storage_message, remove_local_override_message, reset_storage_message,
    storage_request_message::Msg, storage_return_message, FlagOverride, FlagOverrideMessage,
    FlagOverrideType, FlagQueryMessage, FlagQueryReturnMessage, FlagSelector, ListStorageMessage,
    NewStorageMessage, OtaFlagStagingMessage, RemoveLocalOverrideMessage, RemoveOverrideType,
    ResetStorageMessage,
};
use flagstore_lib::{parse_flag_value, pick_value, FlagResolver, ResolveRequest, ValueSources};

use crate::client::split_flag;
use crate::server::{DaemonConfig, FlagstoreConfig};

#[derive(Parser, Debug)]
#[command(name = "flagstore")]
#[command(version)]
#[command(about = "Device feature flag storage daemon and client", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(ClapArgs, Debug)]
struct ConfigArgs {
    /// Path to config file
    #[arg(short = 'c', long = "config", default_value = "flagstore.toml")]
    config: String,

    /// Daemon root directory
    #[arg(long = "root")]
    root_dir: Option<String>,

    /// Daemon socket path
    #[arg(short = 's', long = "socket")]
    socket: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the storage daemon on its unix socket
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Apply staged overrides to the boot copies (once per boot)
    Init {
        #[command(flatten)]
        config: ConfigArgs,

        /// Build id of the running system
        #[arg(short = 'b', long = "build-id")]
        build_id: Option<String>,
    },
    /// Install or update the storage files of a container
    NewStorage {
        #[command(flatten)]
        config: ConfigArgs,

        container: String,
        package_map: String,
        flag_map: String,
        flag_val: String,
        flag_info: String,
    },
    List {
        #[command(flatten)]
        config: ConfigArgs,

        /// Only flags of this container
        #[arg(long = "container", conflicts_with = "package")]
        container: Option<String>,

        /// Only flags of this package
        #[arg(short = 'p', long = "package")]
        package: Option<String>,

        /// Print JSON instead of a table
        #[arg(long = "json")]
        json: bool,
    },
    /// Show every value the daemon knows for a flag
    Query {
        #[command(flatten)]
        config: ConfigArgs,

        /// Flag as <package>.<flag>
        flag: String,
    },
    Override {
        #[command(flatten)]
        config: ConfigArgs,

        /// Flag as <package>.<flag>
        flag: String,

        /// true or false
        value: String,

        /// Take effect without a reboot
        #[arg(long = "immediate", conflicts_with = "server")]
        immediate: bool,

        /// Stage as a server override
        #[arg(long = "server")]
        server: bool,
    },
    /// Remove local overrides of a flag, a package or everything
    Unset {
        #[command(flatten)]
        config: ConfigArgs,

        /// Flag as <package>.<flag>, or a package name with --package
        target: Option<String>,

        /// Treat the target as a package name
        #[arg(short = 'p', long = "package")]
        package: bool,

        /// Remove local overrides of every flag
        #[arg(long = "all", conflicts_with = "target")]
        all: bool,

        /// Remove immediate overrides instead of on-reboot ones
        #[arg(long = "immediate")]
        immediate: bool,
    },
    /// Drop all staged overrides
    Reset {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long = "container")]
        container: Option<String>,
    },
    /// Stage flags for the next boot of a build
    StageOta {
        #[command(flatten)]
        config: ConfigArgs,

        build_id: String,

        /// Overrides as <package>.<flag>=<value>
        overrides: Vec<String>,
    },
    /// Resolve a flag straight from the mapped storage files
    Get {
        #[command(flatten)]
        config: ConfigArgs,

        /// Flag as <package>.<flag>
        flag: String,

        #[arg(long = "container")]
        container: Option<String>,

        /// Value when the flag is not declared
        #[arg(short = 'd', long = "default", default_value = "false")]
        default: String,
    },
}

fn load_config(args: &ConfigArgs) -> DaemonConfig {
    let mut config = FlagstoreConfig::load(&args.config);
    config.apply_env_overrides();

    // CLI args override env and config file values
    if let Some(root_dir) = &args.root_dir {
        config.daemon.root_dir = root_dir.clone();
    }
    if let Some(socket) = &args.socket {
        config.daemon.socket_path = socket.clone();
    }
    config.daemon
}

fn exit_on_err<T>(result: Result<T, String>) -> T {
    result.unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1);
    })
}

fn absolute(path: &str) -> String {
    let path = Path::new(path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| PathBuf::from(path))
    };
    path.display().to_string()
}

#[derive(serde::Serialize)]
struct FlagRow {
    container: String,
    package: String,
    flag: String,
    value: String,
    staged: Option<String>,
    source: String,
    readwrite: bool,
}

impl FlagRow {
    fn from_query(q: FlagQueryReturnMessage) -> Result<Self, String> {
        let parse = |v: &str| parse_flag_value(v).map_err(|e| e.to_string());
        let sources = ValueSources {
            local_immediate: None,
            local_on_reboot: q.local_flag_value.as_deref().map(parse).transpose()?,
            server_on_reboot: q.server_flag_value.as_deref().map(parse).transpose()?,
            default: parse(&q.default_flag_value)?,
        };
        let next = pick_value(&sources, q.is_readwrite);
        let boot = parse(&q.boot_flag_value)?;
        Ok(FlagRow {
            container: q.container,
            package: q.package_name,
            flag: q.flag_name,
            value: q.boot_flag_value,
            staged: (next.value != boot).then(|| next.value.to_string()),
            source: next.picked_from.as_str().to_string(),
            readwrite: q.is_readwrite,
        })
    }
}

async fn run_list(
    config: &DaemonConfig,
    container: Option<String>,
    package: Option<String>,
    json: bool,
) -> Result<(), String> {
    let selection = match (container, package) {
        (Some(container), _) => list_storage_message::Msg::Container(container),
        (None, Some(package)) => list_storage_message::Msg::PackageName(package),
        (None, None) => list_storage_message::Msg::All(true),
    };
    let ret = client::send(
        &config.socket_path,
        Msg::ListStorageMessage(ListStorageMessage {
            msg: Some(selection),
        }),
    )
    .await?;
    let flags = match ret {
        storage_return_message::Msg::ListStorageMessage(list) => list.flags,
        _ => return Err("Unexpected response to list request".to_string()),
    };
    let rows = flags
        .into_iter()
        .map(FlagRow::from_query)
        .collect::<Result<Vec<_>, _>>()?;

    if json {
        let out = serde_json::to_string_pretty(&rows).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No flags found");
        return Ok(());
    }
    let width = rows
        .iter()
        .map(|r| r.package.len() + r.flag.len() + 1)
        .max()
        .unwrap_or(0);
    println!(
        "{:<width$}  {:<6}  {:<6}  {:<17}  {:<10}  container",
        "flag", "value", "staged", "source", "permission"
    );
    for row in &rows {
        println!(
            "{:<width$}  {:<6}  {:<6}  {:<17}  {:<10}  {}",
            format!("{}.{}", row.package, row.flag),
            row.value,
            row.staged.as_deref().unwrap_or("-"),
            row.source,
            if row.readwrite { "read-write" } else { "read-only" },
            row.container,
        );
    }
    Ok(())
}

async fn run_query(config: &DaemonConfig, flag: &str) -> Result<(), String> {
    let (package, flag) = split_flag(flag)?;
    let ret = client::send(
        &config.socket_path,
        Msg::FlagQueryMessage(FlagQueryMessage {
            package_name: package.to_string(),
            flag_name: flag.to_string(),
        }),
    )
    .await?;
    let q = match ret {
        storage_return_message::Msg::FlagQueryMessage(q) => q,
        _ => return Err("Unexpected response to query request".to_string()),
    };
    println!("{}.{} ({})", q.package_name, q.flag_name, q.container);
    println!("  default:  {}", q.default_flag_value);
    println!("  boot:     {}", q.boot_flag_value);
    println!(
        "  server:   {}",
        q.server_flag_value.as_deref().unwrap_or("-")
    );
    println!(
        "  local:    {}",
        q.local_flag_value.as_deref().unwrap_or("-")
    );
    println!(
        "  access:   {}",
        if q.is_readwrite { "read-write" } else { "read-only" }
    );
    if q.has_boot_local_override {
        println!("  boot value includes a local override");
    }
    Ok(())
}

async fn run_override(
    config: &DaemonConfig,
    flag: &str,
    value: &str,
    immediate: bool,
    server: bool,
) -> Result<(), String> {
    let (package, flag) = split_flag(flag)?;
    parse_flag_value(value).map_err(|e| e.to_string())?;
    let override_type = match (immediate, server) {
        (true, _) => FlagOverrideType::LocalImmediate,
        (false, true) => FlagOverrideType::ServerOnReboot,
        (false, false) => FlagOverrideType::LocalOnReboot,
    };
    client::send(
        &config.socket_path,
        Msg::FlagOverrideMessage(FlagOverrideMessage {
            package_name: package.to_string(),
            flag_name: flag.to_string(),
            flag_value: value.to_string(),
            override_type: override_type as i32,
        }),
    )
    .await?;
    println!("{}.{} = {} ({:?})", package, flag, value, override_type);
    Ok(())
}

async fn run_unset(
    config: &DaemonConfig,
    target: Option<String>,
    package: bool,
    all: bool,
    immediate: bool,
) -> Result<(), String> {
    use remove_local_override_message::Target;

    let target = match (target, all) {
        (None, true) => Target::All(true),
        (Some(name), false) if package => Target::PackageName(name),
        (Some(name), false) => {
            let (package, flag) = split_flag(&name)?;
            Target::Flag(FlagSelector {
                package_name: package.to_string(),
                flag_name: flag.to_string(),
            })
        }
        _ => return Err("Specify a flag, a package with --package, or --all".to_string()),
    };
    let remove_type = if immediate {
        RemoveOverrideType::RemoveLocalImmediate
    } else {
        RemoveOverrideType::RemoveLocalOnReboot
    };
    client::send(
        &config.socket_path,
        Msg::RemoveLocalOverrideMessage(RemoveLocalOverrideMessage {
            target: Some(target),
            remove_override_type: remove_type as i32,
        }),
    )
    .await?;
    println!("Removed local overrides");
    Ok(())
}

async fn run_reset(config: &DaemonConfig, container: Option<String>) -> Result<(), String> {
    let selection = match &container {
        Some(container) => reset_storage_message::Msg::Container(container.clone()),
        None => reset_storage_message::Msg::All(true),
    };
    client::send(
        &config.socket_path,
        Msg::ResetStorageMessage(ResetStorageMessage {
            msg: Some(selection),
        }),
    )
    .await?;
    println!(
        "Reset overrides of {}",
        container.as_deref().unwrap_or("all containers")
    );
    Ok(())
}

/// Parses `package.flag=value` pairs for OTA staging.
fn parse_ota_overrides(pairs: &[String]) -> Result<Vec<FlagOverride>, String> {
    pairs
        .iter()
        .map(|pair| {
            let (qualified, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Expected <package>.<flag>=<value>, got {:?}", pair))?;
            let (package, flag) = split_flag(qualified.trim())?;
            let value = value.trim();
            parse_flag_value(value).map_err(|e| e.to_string())?;
            Ok(FlagOverride {
                package_name: package.to_string(),
                flag_name: flag.to_string(),
                flag_value: value.to_string(),
                override_type: FlagOverrideType::ServerOnReboot as i32,
            })
        })
        .collect()
}

async fn run_stage_ota(
    config: &DaemonConfig,
    build_id: String,
    overrides: &[String],
) -> Result<(), String> {
    let overrides = parse_ota_overrides(overrides)?;
    let count = overrides.len();
    client::send(
        &config.socket_path,
        Msg::OtaStagingMessage(OtaFlagStagingMessage {
            build_id: build_id.clone(),
            overrides,
        }),
    )
    .await?;
    println!("Staged {} flags for build {}", count, build_id);
    Ok(())
}

async fn run_new_storage(config: &DaemonConfig, msg: NewStorageMessage) -> Result<(), String> {
    let container = msg.container.clone();
    let ret = client::send(&config.socket_path, Msg::NewStorageMessage(msg)).await?;
    match ret {
        storage_return_message::Msg::NewStorageMessage(m) if m.storage_updated => {
            println!("Installed storage for {}", container)
        }
        storage_return_message::Msg::NewStorageMessage(_) => {
            println!("Storage for {} is up to date", container)
        }
        _ => return Err("Unexpected response to new storage request".to_string()),
    }
    Ok(())
}

fn run_get(
    config: &DaemonConfig,
    flag: &str,
    container: Option<&str>,
    default: &str,
) -> Result<(), String> {
    let (package, flag) = split_flag(flag)?;
    let default = parse_flag_value(default).map_err(|e| e.to_string())?;
    let resolver = FlagResolver::new(&config.root_dir());
    let mut request = ResolveRequest::new(package, flag, default);
    if let Some(container) = container {
        request = request.in_container(container);
    }
    let value = resolver
        .resolve(&request)
        .map_err(|e| format!("{}: {}", e.code().as_str(), e))?;
    println!("{} ({})", value.value, value.picked_from.as_str());
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Args::parse();
    match cli.cmd {
        Command::Serve { config } => server::run_serve(load_config(&config)).await,
        Command::Init { config, build_id } => {
            let mut config = load_config(&config);
            if build_id.is_some() {
                config.build_id = build_id;
            }
            server::run_init(config)
        }
        Command::NewStorage {
            config,
            container,
            package_map,
            flag_map,
            flag_val,
            flag_info,
        } => {
            let msg = NewStorageMessage {
                container,
                package_map: absolute(&package_map),
                flag_map: absolute(&flag_map),
                flag_value: absolute(&flag_val),
                flag_info: absolute(&flag_info),
            };
            exit_on_err(run_new_storage(&load_config(&config), msg).await)
        }
        Command::List {
            config,
            container,
            package,
            json,
        } => exit_on_err(run_list(&load_config(&config), container, package, json).await),
        Command::Query { config, flag } => {
            exit_on_err(run_query(&load_config(&config), &flag).await)
        }
        Command::Override {
            config,
            flag,
            value,
            immediate,
            server,
        } => exit_on_err(run_override(&load_config(&config), &flag, &value, immediate, server).await),
        Command::Unset {
            config,
            target,
            package,
            all,
            immediate,
        } => exit_on_err(run_unset(&load_config(&config), target, package, all, immediate).await),
        Command::Reset { config, container } => {
            exit_on_err(run_reset(&load_config(&config), container).await)
        }
        Command::StageOta {
            config,
            build_id,
            overrides,
        } => exit_on_err(run_stage_ota(&load_config(&config), build_id, &overrides).await),
        Command::Get {
            config,
            flag,
            container,
            default,
        } => exit_on_err(run_get(
            &load_config(&config),
            &flag,
            container.as_deref(),
            &default,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ota_overrides() {
        let overrides =
            parse_ota_overrides(&["pkg.a.f1=true".to_string(), "pkg.b.f2 = false".to_string()])
                .unwrap();
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides[0].package_name, "pkg.a");
        assert_eq!(overrides[0].flag_name, "f1");
        assert_eq!(overrides[1].flag_value, "false");

        assert!(parse_ota_overrides(&["pkg.a.f1".to_string()]).is_err());
        assert!(parse_ota_overrides(&["pkg.a.f1=on".to_string()]).is_err());
    }

    #[test]
    fn test_flag_row_shows_staged_value() {
        let row = FlagRow::from_query(FlagQueryReturnMessage {
            package_name: "pkg.a".into(),
            flag_name: "f1".into(),
            server_flag_value: Some("true".into()),
            local_flag_value: None,
            boot_flag_value: "false".into(),
            default_flag_value: "false".into(),
            has_server_override: true,
            is_readwrite: true,
            has_local_override: false,
            has_boot_local_override: false,
            container: "system".into(),
        })
        .unwrap();
        assert_eq!(row.value, "false");
        assert_eq!(row.staged.as_deref(), Some("true"));
        assert_eq!(row.source, "server");
    }

    #[test]
    fn test_cli_parses() {
        let args = Args::try_parse_from([
            "flagstore",
            "override",
            "pkg.a.f1",
            "true",
            "--immediate",
            "--socket",
            "/tmp/flagstore.sock",
        ])
        .unwrap();
        match args.cmd {
            Command::Override {
                config, immediate, ..
            } => {
                assert!(immediate);
                assert_eq!(config.socket.as_deref(), Some("/tmp/flagstore.sock"));
            }
            _ => panic!("expected override"),
        }
        assert!(Args::try_parse_from(["flagstore", "unset", "pkg.a.f1", "--all"]).is_err());
    }
}

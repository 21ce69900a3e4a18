use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use serv::config::Settings;
use serv::descriptor::DescriptorBuilder;
use serv::{CreateOptions, Host, InitSystemKind, LimitKind, ServiceManager, Transition};

/// Options accepted by every command.
#[derive(Debug, Default)]
struct Global {
    config: Option<PathBuf>,
    init_system: Option<InitSystemKind>,
    init_system_version: Option<String>,
    verbose: bool,
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };
    let rest = &args[1..];

    match command.as_str() {
        "generate" => generate(rest),
        "remove" => control(rest, "remove"),
        "start" => control(rest, "start"),
        "stop" => control(rest, "stop"),
        "restart" => control(rest, "restart"),
        "status" => status(rest),
        "list" => {
            list();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"serv - create and control services on any init system

Usage:
    serv generate <cmd> [options]   Generate service files (and optionally deploy/start)
    serv remove <name>              Stop and uninstall a service
    serv status [name]              Print service status as JSON
    serv start <name>               Start a service
    serv stop <name>                Stop a service
    serv restart <name>             Stop, wait, and start a service
    serv list                       List supported init systems
    serv help                       Show this help message

Options for every command:
    --init-system <kind>            systemd, upstart, sysv, nssm, supervisor or runit
    --init-system-version <ver>     Template set to use (default: detected)
    --config <path>                 Settings file (default: /etc/serv/config.toml)
    -v, --verbose                   Debug logging

Options for generate:
    -n, --name <name>               Service name (default: executable name)
    -a, --args <args>               Arguments passed to the command
    -e, --var <KEY=VALUE>           Environment variable (repeatable)
    -u, --user <user>               Run as user (default: root)
    -g, --group <group>             Run as group (default: root)
    --description <text>
    --chdir <dir>                   Working directory (default: /)
    --chroot <dir>                  Root directory (default: /)
    --nice <n>                      Niceness, -20..19
    --umask <octal>
    --limit-<kind> <value>          coredump, cputime, data, file-size, locked-memory,
                                    open-files, user-processes, physical-memory, stack-size
    -d, --deploy                    Deploy and install the service
    -s, --start                     Start the service after deploying it
    --overwrite                     Replace existing files

Examples:
    serv generate /usr/bin/redis-server -a '--port 6380' -n redis -d -s
    serv status redis
    serv remove redis
"#
    );
}

fn next_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<&'a str> {
    iter.next()
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} requires a value", flag))
}

/// Consume a global option. Returns false when `flag` is not one.
fn parse_global<'a>(
    global: &mut Global,
    flag: &str,
    iter: &mut impl Iterator<Item = &'a String>,
) -> Result<bool> {
    match flag {
        "--init-system" => global.init_system = Some(next_value(iter, flag)?.parse()?),
        "--init-system-version" => {
            global.init_system_version = Some(next_value(iter, flag)?.to_string())
        }
        "--config" => global.config = Some(PathBuf::from(next_value(iter, flag)?)),
        "-v" | "--verbose" => global.verbose = true,
        _ => return Ok(false),
    }
    Ok(true)
}

/// Load settings and install the log subscriber.
fn setup(global: &Global) -> Result<Settings> {
    let settings = Settings::load(global.config.as_deref()).context("Failed to load settings")?;

    let level = if global.verbose {
        "debug"
    } else {
        settings.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(settings)
}

fn manager(global: &Global, settings: Settings) -> Result<ServiceManager> {
    let host = Host::local(&settings);
    ServiceManager::new(
        host,
        settings,
        global.init_system,
        global.init_system_version.as_deref(),
    )
    .context("Failed to select an init system")
}

#[cfg(unix)]
fn require_root(action: &str) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("serv {} must be run as root (use sudo)", action);
    }
    Ok(())
}

#[cfg(not(unix))]
fn require_root(_action: &str) -> Result<()> {
    Ok(())
}

fn generate(args: &[String]) -> Result<()> {
    let mut global = Global::default();
    let mut options = CreateOptions::default();
    let mut command: Option<&str> = None;
    let mut builder_args: Vec<(String, String)> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let flag = arg.as_str();
        if parse_global(&mut global, flag, &mut iter)? {
            continue;
        }
        match flag {
            "-d" | "--deploy" => options.deploy = true,
            "-s" | "--start" => options.start = true,
            "--overwrite" => options.overwrite = true,
            _ if flag.starts_with('-') => {
                let value = next_value(&mut iter, flag)?;
                builder_args.push((flag.to_string(), value.to_string()));
            }
            _ if command.is_none() => command = Some(flag),
            _ => bail!("Unexpected argument: {}", flag),
        }
    }

    let command = command.ok_or_else(|| anyhow!("Usage: serv generate <cmd> [options]"))?;
    let settings = setup(&global)?;

    let mut builder = DescriptorBuilder::new(command);
    for (flag, value) in builder_args {
        builder = apply_option(builder, &flag, value)?;
    }

    let manager = manager(&global, settings)?;
    let descriptor = builder
        .init_system(manager.selection().kind)
        .init_system_version(manager.selection().version.clone())
        .build()?;

    if options.deploy {
        require_root("generate --deploy")?;
    }

    let generated = manager.create(&descriptor, options)?;
    for path in generated.paths() {
        println!("{}", path.display());
    }
    Ok(())
}

fn apply_option(builder: DescriptorBuilder, flag: &str, value: String) -> Result<DescriptorBuilder> {
    let builder = match flag {
        "-n" | "--name" => builder.name(value),
        "-a" | "--args" => builder.arguments(value),
        "-e" | "--var" => builder.env(value),
        "-u" | "--user" => builder.user(value),
        "-g" | "--group" => builder.group(value),
        "--description" => builder.description(value),
        "--chdir" => builder.working_directory(value),
        "--chroot" => builder.root_directory(value),
        "--nice" => builder.nice(
            value
                .parse()
                .with_context(|| format!("--nice expects an integer, got {}", value))?,
        ),
        "--umask" => builder.umask(
            u32::from_str_radix(&value, 8)
                .with_context(|| format!("--umask expects an octal value, got {}", value))?,
        ),
        _ => {
            let param = flag.trim_start_matches("--").replace('-', "_");
            match LimitKind::from_param(&param) {
                Some(kind) => builder.limit(kind, value),
                None => bail!("Unknown option: {}", flag),
            }
        }
    };
    Ok(builder)
}

/// Parse `<name>` plus global options.
fn name_and_globals(args: &[String], required: bool) -> Result<(Global, Option<String>)> {
    let mut global = Global::default();
    let mut name = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if parse_global(&mut global, arg, &mut iter)? {
            continue;
        }
        if arg.starts_with('-') {
            bail!("Unknown option: {}", arg);
        }
        if name.replace(arg.clone()).is_some() {
            bail!("Unexpected argument: {}", arg);
        }
    }

    if required && name.is_none() {
        bail!("A service name is required");
    }
    Ok((global, name))
}

fn control(args: &[String], action: &str) -> Result<()> {
    let (global, name) = name_and_globals(args, true)?;
    let name = name.unwrap_or_default();
    let settings = setup(&global)?;
    require_root(action)?;
    let manager = manager(&global, settings)?;

    let transition = match action {
        "remove" => manager.remove(&name).map(|_| Transition::Changed),
        "start" => manager.start(&name),
        "stop" => manager.stop(&name),
        "restart" => manager.restart(&name),
        _ => bail!("Unknown action: {}", action),
    }
    .with_context(|| format!("Failed to {} {}", action, name))?;

    match transition {
        Transition::Changed => println!("{}: {} done", name, action),
        Transition::AlreadyInState => println!("{}: nothing to do", name),
    }
    Ok(())
}

fn status(args: &[String]) -> Result<()> {
    let (global, name) = name_and_globals(args, false)?;
    let settings = setup(&global)?;
    let manager = manager(&global, settings)?;

    let record = manager.status(name.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn list() {
    println!("Supported init systems:");
    for kind in InitSystemKind::all() {
        println!("    {:<12} templates: {}", kind.name(), kind.template_versions().join(", "));
    }
}

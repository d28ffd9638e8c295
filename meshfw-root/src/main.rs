use std::path::Path;
use std::process;

use meshfw_lib::config::{self, Config};
use meshfw_lib::logging;
use meshfw_lib::netfilter::{self, Family, IptablesRunner, PacketFilterController};

mod cli;

use cli::{Command, LoopbackAction, Toggle};

fn load_config(path: &Path) -> Result<Config, exitcode::ExitCode> {
    match config::read(path) {
        Ok(config) => Ok(config),
        Err(config::Error::NoFile) => {
            tracing::info!(path = %path.display(), "no configuration file - using defaults");
            Ok(Config::default())
        }
        Err(err) => {
            tracing::error!(error = %err, path = %path.display(), "error reading configuration");
            Err(exitcode::CONFIG)
        }
    }
}

fn apply_tunnel_override(config: Config, tunnel: Option<String>) -> Result<Config, exitcode::ExitCode> {
    match tunnel {
        Some(name) => config.with_tunnel(name).map_err(|err| {
            tracing::error!(error = %err, "invalid tunnel override");
            exitcode::USAGE
        }),
        None => Ok(config),
    }
}

fn firewall_error(context: &'static str) -> impl FnOnce(netfilter::Error) -> exitcode::ExitCode {
    move |err| {
        tracing::error!(error = %err, kind = ?err.kind(), "{context}");
        exitcode::SOFTWARE
    }
}

fn warn_hook(line: &str) {
    tracing::warn!("{line}");
}

fn up<C: PacketFilterController>(runner: &mut IptablesRunner<C>, config: &Config) -> Result<(), netfilter::Error> {
    let tun = config.tunnel();
    // ensure clean state by removing leftovers of a previous run first
    runner.clean_up(warn_hook)?;
    runner.add_chains()?;
    runner.add_hooks()?;
    runner.add_base(tun)?;
    for addr in config.firewall.loopback_addrs.iter() {
        runner.add_loopback_rule(*addr)?;
    }
    if config.firewall.stateful {
        runner.add_stateful_rule(tun)?;
    }
    if config.firewall.subnet_routing {
        runner.add_snat_rule()?;
    }
    if let Some(port) = config.firewall.listen_port {
        for family in [Family::V4, Family::V6] {
            runner.add_magicsock_port_rule(port, family)?;
        }
    }
    tracing::info!(tunnel = tun, "mesh firewall up");
    Ok(())
}

fn down<C: PacketFilterController>(runner: &mut IptablesRunner<C>, config: &Config) -> Result<(), netfilter::Error> {
    let tun = config.tunnel();
    if let Some(port) = config.firewall.listen_port {
        for family in [Family::V4, Family::V6] {
            runner.del_magicsock_port_rule(port, family)?;
        }
    }
    runner.del_snat_rule()?;
    runner.del_stateful_rule(tun)?;
    for addr in config.firewall.loopback_addrs.iter() {
        runner.del_loopback_rule(*addr)?;
    }
    runner.del_base()?;
    runner.del_hooks(warn_hook)?;
    runner.del_chains()?;
    tracing::info!(tunnel = tun, "mesh firewall down");
    Ok(())
}

fn run(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    let config = load_config(&args.config_path)?;
    let config = apply_tunnel_override(config, args.tunnel)?;

    let mut runner = netfilter::new_iptables_runner(config.rule_params()).map_err(|err| {
        tracing::error!(error = %err, "packet filter unavailable");
        exitcode::UNAVAILABLE
    })?;

    match args.command {
        Command::Up => up(&mut runner, &config).map_err(firewall_error("error bringing firewall up")),
        Command::Down => down(&mut runner, &config).map_err(firewall_error("error bringing firewall down")),
        Command::Cleanup => runner
            .clean_up(warn_hook)
            .map_err(firewall_error("error cleaning up firewall")),
        Command::Status => {
            println!("tunnel:    {}", config.tunnel());
            println!("ipv6:      {}", runner.has_ipv6());
            println!("ipv4 nat:  {}", runner.has_ipv4_nat());
            println!("ipv6 nat:  {}", runner.has_ipv6_nat());
            Ok(())
        }
        Command::Loopback { action } => {
            let res = match action {
                LoopbackAction::Add { addr } => runner.add_loopback_rule(addr),
                LoopbackAction::Del { addr } => runner.del_loopback_rule(addr),
            };
            res.map_err(firewall_error("error updating loopback rule"))
        }
        Command::Snat { action } => {
            let res = match action {
                Toggle::Enable => runner.add_snat_rule(),
                Toggle::Disable => runner.del_snat_rule(),
            };
            res.map_err(firewall_error("error updating masquerade rule"))
        }
    }
}

fn main() {
    let args = cli::parse();

    match args.log_file.as_deref() {
        Some(path) => {
            if let Err(err) = logging::setup_log_file(path) {
                eprintln!("error opening log file {}: {err}", path.display());
                process::exit(exitcode::CANTCREAT);
            }
        }
        None => logging::setup_stdout(),
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    if let Err(code) = run(args) {
        tracing::warn!("abnormal exit");
        process::exit(code);
    }
}

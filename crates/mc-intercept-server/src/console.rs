//! Admin commands read from stdin.

use std::time::{SystemTime, UNIX_EPOCH};

use mc_intercept_core::diagnostics::HistoryEntry;
use mc_intercept_core::{PlayerDirectory, ProtocolManager, SendOutcome};
use mc_intercept_proto::{PacketContainer, PacketType};

use crate::config::InterceptConfig;

const DEFAULT_HISTORY_LINES: usize = 10;

const HELP: &str = "Commands: connections | listeners | history <player> [n] | \
filter load <name> <expression> | filter remove <name> | filter list | filter reload | \
pcap start <player> | pcap stop <player> | dump <player> on|off | \
send <player> <TYPE> [field=value..] | debug on|off";

/// Run one console line and return the text to show.
pub async fn execute(manager: &ProtocolManager, config: &InterceptConfig, line: &str) -> String {
    let args: Vec<&str> = line.split_whitespace().collect();
    match args.as_slice() {
        ["connections"] => connections(manager),
        ["listeners"] => listeners(manager),
        ["history", player] => history(manager, player, DEFAULT_HISTORY_LINES),
        ["history", player, n] => match n.parse() {
            Ok(n) => history(manager, player, n),
            Err(_) => format!("Not a number: {n}"),
        },
        ["filter", "list"] => {
            let names = manager.filter_names();
            if names.is_empty() {
                "No filters loaded".into()
            } else {
                format!("Filters: {}", names.join(", "))
            }
        }
        ["filter", "remove", name] => {
            if manager.remove_filter(name) {
                format!("Removed filter '{name}'")
            } else {
                format!("No filter named '{name}'")
            }
        }
        ["filter", "reload"] => match manager.load_filter_dir(&config.scripts.directory) {
            Ok(n) => format!("Loaded {n} filters from {}", config.scripts.directory.display()),
            Err(e) => format!("Reload failed: {e}"),
        },
        ["filter", "load", name, expression @ ..] if !expression.is_empty() => {
            match manager.load_filter(name, &expression.join(" "), &[]) {
                Ok(()) => format!("Loaded filter '{name}'"),
                Err(e) => format!("Filter '{name}' rejected: {e}"),
            }
        }
        ["pcap", "start", player] => pcap_start(manager, config, player).await,
        ["pcap", "stop", player] => {
            let Some(p) = manager.registry().find_by_name(player) else {
                return format!("No player named '{player}'");
            };
            match manager.diagnostics().pcap().stop(p.id).await {
                Some(path) => format!("Capture written to {}", path.display()),
                None => format!("{} is not being captured", p.name),
            }
        }
        ["dump", player, toggle @ ("on" | "off")] => {
            let Some(p) = manager.registry().find_by_name(player) else {
                return format!("No player named '{player}'");
            };
            let enabled = *toggle == "on";
            manager.diagnostics().set_dump(p.id, enabled);
            format!("Traffic dump for {} {toggle}", p.name)
        }
        ["send", player, type_name, fields @ ..] => send(manager, player, type_name, fields),
        ["debug", "on"] => {
            manager.set_debug(true);
            "Packet debug on".into()
        }
        ["debug", "off"] => {
            manager.set_debug(false);
            "Packet debug off".into()
        }
        _ => HELP.into(),
    }
}

fn connections(manager: &ProtocolManager) -> String {
    let online = manager.online();
    if online.is_empty() {
        return "No connections".into();
    }
    let mut out = vec![format!("{} connection(s):", online.len())];
    for p in online {
        let phase = manager
            .registry()
            .get(p.id)
            .map_or("?", |i| i.phase().name());
        let (version, loader) = manager
            .capabilities()
            .info(p.id)
            .map(|c| (c.version_name(), c.mod_loader.name()))
            .unwrap_or_else(|| ("?".into(), "?"));
        let address = p.address.map_or_else(|| "-".to_string(), |a| a.to_string());
        out.push(format!(
            "  {} {} {address} phase={phase} version={version} loader={loader}",
            p.name, p.id
        ));
    }
    out.join("\n")
}

fn listeners(manager: &ProtocolManager) -> String {
    let listeners = manager.pipeline().listeners();
    if listeners.is_empty() {
        return "No listeners".into();
    }
    let mut out = vec![format!("{} listener(s):", listeners.len())];
    for l in listeners {
        out.push(format!(
            "  {} [{:?}]{}",
            l.name(),
            l.priority(),
            if l.is_enabled() { "" } else { " (disabled)" }
        ));
    }
    out.join("\n")
}

fn history(manager: &ProtocolManager, player: &str, n: usize) -> String {
    let Some(p) = manager.registry().find_by_name(player) else {
        return format!("No player named '{player}'");
    };
    let Some(history) = manager.diagnostics().history().get(p.id) else {
        return format!("No history for {}", p.name);
    };
    let mut out = vec![format!("Last {n} packets of {}:", p.name)];
    out.push("  incoming:".into());
    out.extend(history.last_incoming(n).iter().map(history_line));
    out.push("  outgoing:".into());
    out.extend(history.last_outgoing(n).iter().map(history_line));
    out.join("\n")
}

fn history_line(entry: &HistoryEntry) -> String {
    let age = entry
        .timestamp
        .elapsed()
        .map(|d| format!("{:.1}s", d.as_secs_f32()))
        .unwrap_or_else(|_| "now".into());
    format!(
        "    {age:>7} {}{}",
        entry.summary,
        if entry.cancelled { " (cancelled)" } else { "" }
    )
}

fn send(manager: &ProtocolManager, player: &str, type_name: &str, fields: &[&str]) -> String {
    let Some(p) = manager.registry().find_by_name(player) else {
        return format!("No player named '{player}'");
    };
    let Some(packet_type) = PacketType::from_name(type_name) else {
        return format!("Unknown packet type {type_name}");
    };
    let packet = match manager.create_packet(packet_type) {
        Ok(packet) => packet,
        Err(e) => return format!("Cannot create {packet_type}: {e}"),
    };
    let packet = match fill_fields(packet, fields) {
        Ok(packet) => packet,
        Err(message) => return message,
    };
    let summary = packet.summary();
    match manager.send_packet(p.id, packet) {
        SendOutcome::Sent => format!("Sent {summary} to {}", p.name),
        SendOutcome::Cancelled => format!("{packet_type} to {} was cancelled by a listener", p.name),
        SendOutcome::Dropped => format!("{packet_type} to {} was dropped", p.name),
    }
}

/// Apply `name=value` assignments by field name.
fn fill_fields(mut packet: PacketContainer, fields: &[&str]) -> Result<PacketContainer, String> {
    for assignment in fields {
        let Some((name, text)) = assignment.split_once('=') else {
            return Err(format!("Expected field=value, got '{assignment}'"));
        };
        let class = packet.handle().class().clone();
        let Some((index, decl)) = class.layout().iter().enumerate().find(|(_, d)| d.name == name)
        else {
            return Err(format!("{} has no field '{name}'", class.name()));
        };
        let value = decl
            .kind
            .value_type()
            .parse(text)
            .map_err(|e| format!("Field '{name}': {e}"))?;
        packet
            .fields()
            .write(index, value)
            .map_err(|e| format!("Field '{name}': {e}"))?;
    }
    Ok(packet)
}

async fn pcap_start(manager: &ProtocolManager, config: &InterceptConfig, player: &str) -> String {
    let Some(p) = manager.registry().find_by_name(player) else {
        return format!("No player named '{player}'");
    };
    let dir = &config.diagnostics.pcap_directory;
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        return format!("Cannot create {}: {e}", dir.display());
    }
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let path = dir.join(format!("{}-{stamp}.pcap", p.name));
    match manager.diagnostics().pcap().start(p.id, &path).await {
        Ok(()) => format!("Capturing {} to {}", p.name, path.display()),
        Err(e) => format!("Capture failed: {e}"),
    }
}

use std::env;

use anyhow::Result;
use itertools::Itertools;
use nebula_dialplan::{
    config::DEFAULT_CONFIG_PATH,
    loader::{self, DialplanFile},
    priority::PRIORITY_HINT,
    Config, Engine,
};
use tracing::{info, warn};

const DEFAULT_DIALPLAN_PATH: &str = "/etc/nebula/extensions.toml";

fn show(engine: &Engine) {
    for context in engine.registry().contexts() {
        println!("[ Context '{}' created by '{}' ]", context.name(), context.registrar());
        for extension in context.extensions() {
            let exten = match &extension.cidmatch {
                Some(cid) => format!("'{}' (CID match '{cid}')", extension.exten),
                None => format!("'{}'", extension.exten),
            };
            for priority in extension.priorities() {
                let step = if priority.priority == PRIORITY_HINT {
                    format!("hint: {}", priority.app)
                } else {
                    let label = priority
                        .label
                        .as_ref()
                        .map(|l| format!("({l})"))
                        .unwrap_or_default();
                    format!("{}.{label} {}({})", priority.priority, priority.app, priority.data)
                };
                println!("  {exten:<24} => {step:<40} [{}]", priority.registrar);
            }
        }
        for include in context.includes() {
            println!("  Include => '{}' [{}]", include.value, include.registrar);
        }
        for pattern in context.ignore_patterns() {
            println!("  Ignore pattern => '{}' [{}]", pattern.pattern, pattern.registrar);
        }
        for switch in context.switches() {
            let kind = if switch.eval { "Eswitch" } else { "Switch" };
            println!("  Alt. {kind} => '{}/{}' [{}]", switch.name, switch.data, switch.registrar);
        }
        println!();
    }

    let hints = engine.hints().hints();
    println!("-= Registered hints: {} =-", hints.len());
    for hint in hints {
        println!(
            "  {}@{}: {} State:{:?} Watchers {}",
            hint.exten, hint.context, hint.devices, hint.last_state, hint.watchers
        );
    }

    let apps = engine.applications().list();
    println!("-= Registered applications: {} =-", apps.len());
    println!("  {}", apps.iter().map(|a| a.name.as_str()).join(", "));
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = nebula_log::init();
    let mut args = env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let dialplan_path = args.next().unwrap_or_else(|| DEFAULT_DIALPLAN_PATH.to_string());

    let config = Config::from_file(&config_path).unwrap_or_else(|err| {
        warn!("can't read config {config_path}: {err}, using defaults");
        Config::default()
    });
    let engine = Engine::new(config);
    let file = DialplanFile::from_file(&dialplan_path)?;
    let contexts = loader::load(&engine, &file, "extensions")?;
    info!("{dialplan_path}: {contexts} contexts");

    show(&engine);
    engine.teardown();
    Ok(())
}

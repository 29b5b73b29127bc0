//! vsa-plan - print the resolved disk filters and backup steps for a plan file.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use vsa_orchestrator::engine::plan_steps;
use vsa_orchestrator::filter::resolve_order;
use vsa_orchestrator::inventory::{Inventory, VmRecord};
use vsa_orchestrator::model::{BackupKind, BackupRequest, DiskFilterRule};
use vsa_orchestrator::{utils, DiskFilterResolver, DispatchTable, EngineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Plan file (TOML) with VMs, group filters and an optional backup request
    #[arg(value_name = "FILE")]
    plan: PathBuf,

    /// Path to engine configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    vms: Vec<VmRecord>,
    #[serde(default)]
    groups: BTreeMap<String, GroupSection>,
    backup: Option<BackupRequest>,
}

#[derive(Debug, Deserialize)]
struct GroupSection {
    #[serde(default)]
    filters: Vec<DiskFilterRule>,
}

#[derive(Debug, Serialize)]
struct VmPlan {
    vm: String,
    order: Vec<String>,
    excluded: Vec<String>,
    remaining: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Plan {
    vms: Vec<VmPlan>,
    steps: Vec<BackupKind>,
}

fn build_plan(file: PlanFile) -> Result<Plan> {
    let mut inventory = Inventory::new();
    for (group, section) in file.groups {
        inventory.set_group_filters(group, section.filters);
    }
    for vm in file.vms {
        inventory.insert(vm);
    }

    let resolver = DiskFilterResolver::new();
    let mut vms = Vec::new();
    for (handle, record) in inventory.iter() {
        let rules = inventory.effective_filters(handle);
        let outcome = resolver
            .resolve(&record.disks, &rules)
            .with_context(|| format!("resolving disk filters for {}", record.name))?;
        vms.push(VmPlan {
            vm: record.name.clone(),
            order: resolve_order(&rules).iter().map(ToString::to_string).collect(),
            excluded: outcome.excluded_ids(),
            remaining: outcome.remaining.iter().map(|d| d.id.clone()).collect(),
        });
    }

    let steps = match &file.backup {
        Some(request) => {
            let adapter = DispatchTable::with_defaults().lookup(request.platform())?;
            plan_steps(request, adapter.capabilities())?
        }
        None => Vec::new(),
    };

    Ok(Plan { vms, steps })
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref())?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let content = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("reading plan file {}", args.plan.display()))?;
    let file: PlanFile = toml::from_str(&content).context("parsing plan file")?;
    let plan = build_plan(file)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for vm in &plan.vms {
        println!("{}", vm.vm);
        println!("  order:     {}", vm.order.join(", "));
        println!("  excluded:  {}", vm.excluded.join(", "));
        println!("  remaining: {}", vm.remaining.join(", "));
    }
    if !plan.steps.is_empty() {
        let steps: Vec<&str> = plan.steps.iter().map(|k| k.as_str()).collect();
        println!("backup steps: {}", steps.join(" -> "));
    }

    Ok(())
}

//! Deployment configuration.
//!
//! A deployment is data: which packages to publish, what to capture from
//! their output, and the ordered calls that follow. The built-in profiles
//! cover the node bootstrap variants; anything else is a JSON file.
use crate::error::{DeployError, Result};
use crate::selector::Selector;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_CLIENT: &str = "sui client";
pub const CLIENT_ENV: &str = "CHAINBOOT_CLIENT";
pub const LOCAL_CONFIG_FILE: &str = "chainboot.json";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    pub schema_version: u32,
    /// Client command, split with shell-words (e.g. `"sui client"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Flag appended to every client call to request JSON output.
    #[serde(default = "default_json_flag")]
    pub json_flag: String,
    /// Directories, relative to the run root, searched in order for packages.
    pub search_roots: Vec<String>,
    /// Constants seeded into the bindings before any package is published.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    pub packages: Vec<PackageSpec>,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub report: Vec<ReportLine>,
}

fn default_json_flag() -> String {
    "--json".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    /// Logical name, used by `published` step conditions.
    pub name: String,
    /// Directory name looked up under each search root.
    pub dir: String,
    pub cache_file: String,
    /// Capture holding the published package id; pinned into the manifest.
    pub package_id: String,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    /// Manifest keys pinned to the published package id.
    #[serde(default)]
    pub address_fields: Vec<String>,
    /// Build outputs removed before a fresh publish.
    #[serde(default)]
    pub clean: Vec<String>,
    #[serde(default)]
    pub publish_args: Vec<String>,
    pub captures: Vec<Capture>,
}

fn default_manifest_file() -> String {
    "Move.toml".to_string()
}

/// A named identifier pulled out of a client response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Capture {
    pub name: String,
    #[serde(flatten)]
    pub source: CaptureSource,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum CaptureSource {
    /// Dotted path such as `events[0].parsedJson.db`.
    Path { path: String },
    /// Last entry of `list` whose `key` matches `pattern`; yields `field`.
    Match {
        list: String,
        key: String,
        pattern: String,
        field: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Text2Text,
    Text2Image,
}

impl ModelKind {
    /// On-chain numeric code.
    pub fn code(self) -> u8 {
        match self {
            ModelKind::Text2Text => 0,
            ModelKind::Text2Image => 1,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub name: String,
    pub kind: ModelKind,
    pub echelon: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Call(CallStep),
    /// Run `steps` once per configured model, in model order.
    PerModel { steps: Vec<CallStep> },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CallStep {
    pub label: String,
    /// Package id template, usually a publish capture such as `{atoma_package}`.
    pub package: String,
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captures: Vec<Capture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "if", rename_all = "snake_case")]
pub enum Condition {
    /// The named package was published by this run rather than reused.
    Published { package: String },
    /// Both templates render to the same text.
    Equals { left: String, right: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ReportLine {
    pub label: String,
    pub value: String,
}

/// Built-in deployment profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Profile {
    /// Publish the main package and bootstrap one node.
    Node,
    /// Publish the token package first, fund the node from its faucet, then bootstrap.
    TokenNode,
}

pub fn builtin_config(profile: Profile) -> DeployConfig {
    match profile {
        Profile::Node => node_profile(),
        Profile::TokenNode => token_node_profile(),
    }
}

const GAS_BUDGET: u64 = 900_000_000;

fn base_vars() -> BTreeMap<String, String> {
    [
        ("input_fee_per_token", "1"),
        ("output_fee_per_token", "1"),
        ("relative_performance", "100"),
        ("node_echelon", "1"),
        ("subscription_price", "10000000"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn path_capture(name: &str, path: &str) -> Capture {
    Capture {
        name: name.to_string(),
        source: CaptureSource::Path {
            path: path.to_string(),
        },
    }
}

fn db_call(label: &str, function: &str, args: &[&str]) -> CallStep {
    CallStep {
        label: label.to_string(),
        package: "{atoma_package}".to_string(),
        module: "db".to_string(),
        function: function.to_string(),
        args: strings(args),
        gas_budget: None,
        captures: Vec::new(),
        when: None,
    }
}

fn atoma_package() -> PackageSpec {
    PackageSpec {
        name: "atoma".to_string(),
        dir: "atoma".to_string(),
        cache_file: "atoma_build.json".to_string(),
        package_id: "atoma_package".to_string(),
        manifest_file: default_manifest_file(),
        address_fields: strings(&["published-at", "atoma"]),
        clean: strings(&["build", "Move.lock"]),
        publish_args: vec![
            "--skip-dependency-verification".to_string(),
            "--skip-fetch-latest-git-deps".to_string(),
            "--gas-budget".to_string(),
            GAS_BUDGET.to_string(),
        ],
        captures: vec![
            path_capture("atoma_package", "events[0].packageId"),
            path_capture("atoma_db", "events[0].parsedJson.db"),
            path_capture("atoma_manager_badge", "events[0].parsedJson.manager_badge"),
        ],
    }
}

fn register_step(args: &[&str]) -> CallStep {
    CallStep {
        gas_budget: Some(GAS_BUDGET),
        captures: vec![
            path_capture("node_badge", "events[0].parsedJson.badge_id"),
            path_capture("node_small_id", "events[0].parsedJson.node_small_id.inner"),
        ],
        ..db_call("register node", "register_node_entry", args)
    }
}

fn model_steps() -> Vec<CallStep> {
    vec![
        CallStep {
            gas_budget: Some(GAS_BUDGET),
            ..db_call(
                "add model",
                "add_model_entry",
                &["{atoma_db}", "{atoma_manager_badge}", "{model.name}", "{model.kind}"],
            )
        },
        db_call(
            "add model echelon",
            "add_model_echelon_entry",
            &[
                "{atoma_db}",
                "{atoma_manager_badge}",
                "{model.name}",
                "{model.echelon}",
                "{input_fee_per_token}",
                "{output_fee_per_token}",
                "{relative_performance}",
            ],
        ),
        CallStep {
            captures: vec![path_capture(
                "task_small_id",
                "events[0].parsedJson.task_small_id.inner",
            )],
            ..db_call(
                "create task",
                "create_task_entry",
                &[
                    "{atoma_db}",
                    "{atoma_manager_badge}",
                    "0",
                    "[\"{model.name}\"]",
                    "[\"0\"]",
                    "[\"50\"]",
                    "true",
                ],
            )
        },
        db_call(
            "subscribe node to task",
            "subscribe_node_to_task",
            &["{atoma_db}", "{node_badge}", "{task_small_id}", "{subscription_price}"],
        ),
    ]
}

fn report_lines(with_token: bool) -> Vec<ReportLine> {
    let mut lines = Vec::new();
    if with_token {
        lines.push(("Toma_package", "{toma_package}"));
    }
    lines.extend([
        ("Atoma_package", "{atoma_package}"),
        ("Atoma_db", "{atoma_db}"),
        ("Manager_badge", "{atoma_manager_badge}"),
        ("Badge_id", "{node_badge}"),
        ("Small_id", "{node_small_id}"),
    ]);
    lines
        .into_iter()
        .map(|(label, value)| ReportLine {
            label: label.to_string(),
            value: value.to_string(),
        })
        .collect()
}

fn node_profile() -> DeployConfig {
    DeployConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        client: None,
        json_flag: default_json_flag(),
        search_roots: strings(&["../packages", "sui/packages"]),
        vars: base_vars(),
        packages: vec![atoma_package()],
        models: vec![ModelSpec {
            name: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
            kind: ModelKind::Text2Text,
            echelon: 1,
        }],
        steps: vec![
            Step::Call(register_step(&["{atoma_db}"])),
            Step::PerModel {
                steps: model_steps(),
            },
        ],
        report: report_lines(false),
    }
}

fn token_node_profile() -> DeployConfig {
    let toma = PackageSpec {
        name: "toma".to_string(),
        dir: "toma".to_string(),
        cache_file: "toma_build.json".to_string(),
        package_id: "toma_package".to_string(),
        manifest_file: default_manifest_file(),
        address_fields: strings(&["published-at", "toma"]),
        clean: strings(&["build", "Move.lock"]),
        publish_args: strings(&["--skip-dependency-verification"]),
        captures: vec![
            path_capture("toma_package", "events[0].packageId"),
            path_capture("toma_faucet", "events[0].parsedJson.faucet"),
            path_capture("toma_treasury", "events[0].parsedJson.treasury"),
        ],
    };
    let toma_call = |label: &str, function: &str, args: &[&str]| CallStep {
        package: "{toma_package}".to_string(),
        module: "toma".to_string(),
        ..db_call(label, function, args)
    };

    let mut vars = base_vars();
    vars.insert("collateral_amount".to_string(), "9000000000".to_string());

    let mut per_model = model_steps();
    per_model.push(CallStep {
        when: Some(Condition::Equals {
            left: "{model.echelon}".to_string(),
            right: "{node_echelon}".to_string(),
        }),
        ..db_call(
            "add node to model",
            "add_node_to_model",
            &["{atoma_db}", "{node_badge}", "{model.name}", "{model.echelon}"],
        )
    });

    DeployConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        client: None,
        json_flag: default_json_flag(),
        search_roots: strings(&["../packages", "sui/packages"]),
        vars,
        packages: vec![toma, atoma_package()],
        models: vec![
            ModelSpec {
                name: "stable_diffusion_turbo".to_string(),
                kind: ModelKind::Text2Image,
                echelon: 1,
            },
            ModelSpec {
                name: "mamba_130m".to_string(),
                kind: ModelKind::Text2Text,
                echelon: 1,
            },
        ],
        steps: vec![
            Step::Call(CallStep {
                when: Some(Condition::Published {
                    package: "toma".to_string(),
                }),
                ..toma_call(
                    "enable faucet",
                    "enable_faucet",
                    &["{toma_faucet}", "{toma_treasury}"],
                )
            }),
            Step::Call(CallStep {
                captures: vec![Capture {
                    name: "toma_wallet".to_string(),
                    source: CaptureSource::Match {
                        list: "objectChanges".to_string(),
                        key: "objectType".to_string(),
                        pattern: r"0x2::coin::Coin<(0x[0-9a-f]*)::toma::TOMA>".to_string(),
                        field: "objectId".to_string(),
                    },
                }],
                ..toma_call(
                    "fund collateral",
                    "faucet",
                    &["{toma_faucet}", "{collateral_amount}"],
                )
            }),
            Step::Call(register_step(&["{atoma_db}", "{toma_wallet}"])),
            Step::PerModel { steps: per_model },
        ],
        report: report_lines(true),
    }
}

/// Reject configs that would fail halfway through a run.
pub fn validate_config(config: &DeployConfig) -> Result<()> {
    let invalid = |msg: String| Err(DeployError::InvalidConfig(msg));
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return invalid(format!(
            "unsupported schema_version {}",
            config.schema_version
        ));
    }
    if let Some(client) = &config.client {
        if client.trim().is_empty() {
            return invalid("client must be non-empty".to_string());
        }
    }
    if config.json_flag.trim().is_empty() {
        return invalid("json_flag must be non-empty".to_string());
    }
    if config.search_roots.is_empty() {
        return invalid("search_roots must list at least one directory".to_string());
    }
    if config.packages.is_empty() {
        return invalid("packages must list at least one package".to_string());
    }
    let mut names = BTreeSet::new();
    for package in &config.packages {
        if !names.insert(package.name.as_str()) {
            return invalid(format!("duplicate package name `{}`", package.name));
        }
        if package.dir.trim().is_empty() || package.cache_file.trim().is_empty() {
            return invalid(format!(
                "package `{}` needs both dir and cache_file",
                package.name
            ));
        }
        if !package
            .captures
            .iter()
            .any(|capture| capture.name == package.package_id)
        {
            return invalid(format!(
                "package `{}` has no capture named `{}`",
                package.name, package.package_id
            ));
        }
        validate_captures(&package.captures)?;
    }
    for step in &config.steps {
        match step {
            Step::Call(call) => validate_call(call, &names)?,
            Step::PerModel { steps } => {
                for call in steps {
                    validate_call(call, &names)?;
                }
            }
        }
    }
    Ok(())
}

fn validate_call(call: &CallStep, packages: &BTreeSet<&str>) -> Result<()> {
    if call.module.trim().is_empty() || call.function.trim().is_empty() {
        return Err(DeployError::InvalidConfig(format!(
            "step `{}` needs both module and function",
            call.label
        )));
    }
    if let Some(Condition::Published { package }) = &call.when {
        if !packages.contains(package.as_str()) {
            return Err(DeployError::InvalidConfig(format!(
                "step `{}` is conditioned on unknown package `{package}`",
                call.label
            )));
        }
    }
    validate_captures(&call.captures)
}

fn validate_captures(captures: &[Capture]) -> Result<()> {
    for capture in captures {
        match &capture.source {
            CaptureSource::Path { path } => {
                Selector::parse(path)?;
            }
            CaptureSource::Match { list, pattern, .. } => {
                Selector::parse(list)?;
                Regex::new(pattern).map_err(|err| {
                    DeployError::InvalidConfig(format!(
                        "capture `{}` pattern: {err}",
                        capture.name
                    ))
                })?;
            }
        }
    }
    Ok(())
}

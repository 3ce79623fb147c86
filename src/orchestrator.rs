//! Deployment driver.
//!
//! Per package: locate sources, blank the manifest address, publish through
//! the cache, capture identifiers, pin the manifest. Then run the step list
//! in order, threading captures into later arguments. Every failure aborts
//! the run; nothing is retried or rolled back, and only the publish is
//! protected against repetition by the cache.
use crate::cache::ArtifactCache;
use crate::config::{
    CallStep, Capture, CaptureSource, Condition, DeployConfig, ModelSpec, PackageSpec, Step,
};
use crate::error::{DeployError, Result};
use crate::invoker::{CommandInvoker, Invocation};
use crate::manifest::AddressFields;
use crate::selector::{match_in_list, Selector};
use crate::template::Bindings;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// What a run produced, for printing.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub packages: Vec<PackageOutcome>,
    pub models: Vec<ModelOutcome>,
    pub lines: Vec<ReportEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageOutcome {
    pub name: String,
    pub dir: PathBuf,
    /// False when the publish result came from the cache.
    pub published: bool,
    pub captures: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelOutcome {
    pub model: String,
    pub captures: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub label: String,
    pub value: String,
}

pub struct Orchestrator<'a, I: CommandInvoker> {
    invoker: &'a mut I,
    root: PathBuf,
    bindings: Bindings,
    fresh: BTreeSet<String>,
}

impl<'a, I: CommandInvoker> Orchestrator<'a, I> {
    /// `root` anchors the config's relative search roots.
    pub fn new(invoker: &'a mut I, root: &Path) -> Self {
        Self {
            invoker,
            root: root.to_path_buf(),
            bindings: Bindings::new(),
            fresh: BTreeSet::new(),
        }
    }

    pub fn run(mut self, config: &DeployConfig) -> Result<DeployReport> {
        for (name, value) in &config.vars {
            self.bindings.insert(name.as_str(), value.as_str());
        }

        let mut packages = Vec::with_capacity(config.packages.len());
        for package in &config.packages {
            packages.push(self.deploy_package(config, package)?);
        }

        let mut models = Vec::new();
        for step in &config.steps {
            match step {
                Step::Call(call) => {
                    let mut scope = self.bindings.scope();
                    self.run_call(call, &mut scope)?;
                    self.bindings = scope;
                }
                Step::PerModel { steps } => {
                    for model in &config.models {
                        models.push(self.run_model(model, steps)?);
                    }
                }
            }
        }

        let lines = config
            .report
            .iter()
            .map(|line| {
                Ok(ReportEntry {
                    label: line.label.clone(),
                    value: self.bindings.render(&line.value, "report")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DeployReport {
            packages,
            models,
            lines,
        })
    }

    fn deploy_package(
        &mut self,
        config: &DeployConfig,
        package: &PackageSpec,
    ) -> Result<PackageOutcome> {
        let dir = locate_package(&self.root, &config.search_roots, package)?;
        tracing::info!(package = %package.name, dir = %dir.display(), "located package");

        let manifest_path = dir.join(&package.manifest_file);
        let fields = tracked_fields(package, &manifest_path)?;
        if let Some(fields) = &fields {
            fields.reset(&manifest_path)?;
        }

        let cache = ArtifactCache::new(dir.join(&package.cache_file));
        tracing::debug!(cache = %cache.path().display(), "checking publish cache");
        let outcome = cache.load_or_build(|| {
            clean_build_outputs(&dir, &package.clean)?;
            let mut args = vec!["publish".to_string()];
            args.extend(package.publish_args.iter().cloned());
            self.invoker.invoke(&Invocation::new(args).in_dir(&dir))
        })?;

        let context = format!("publish {}", package.name);
        let captured = extract_captures(&package.captures, &outcome.document, &context)?;
        let package_id = captured
            .get(&package.package_id)
            .cloned()
            .ok_or_else(|| DeployError::InvalidConfig(format!(
                "package `{}` has no capture named `{}`",
                package.name, package.package_id
            )))?;
        if let Some(fields) = &fields {
            fields.pin(&manifest_path, &package_id)?;
        }

        for (name, value) in &captured {
            self.bindings.insert(name.as_str(), value.as_str());
        }
        if outcome.fresh {
            self.fresh.insert(package.name.clone());
        }
        tracing::info!(
            package = %package.name,
            package_id = %package_id,
            published = outcome.fresh,
            "package ready"
        );
        Ok(PackageOutcome {
            name: package.name.clone(),
            dir,
            published: outcome.fresh,
            captures: captured,
        })
    }

    fn run_model(&mut self, model: &ModelSpec, steps: &[CallStep]) -> Result<ModelOutcome> {
        let mut scope = self.bindings.scope();
        scope.insert("model.name", model.name.as_str());
        scope.insert("model.kind", model.kind.to_string());
        scope.insert("model.echelon", model.echelon.to_string());
        let mut captures = BTreeMap::new();
        for call in steps {
            captures.extend(self.run_call(call, &mut scope)?);
        }
        Ok(ModelOutcome {
            model: model.name.clone(),
            captures,
        })
    }

    fn run_call(
        &mut self,
        call: &CallStep,
        scope: &mut Bindings,
    ) -> Result<BTreeMap<String, String>> {
        if let Some(condition) = &call.when {
            if !self.condition_holds(condition, scope, &call.label)? {
                tracing::info!(step = %call.label, "condition not met; skipping");
                return Ok(BTreeMap::new());
            }
        }
        let invocation = Invocation::new(call_args(call, scope)?);
        let document = self.invoker.invoke(&invocation)?;
        let captured = extract_captures(&call.captures, &document, &call.label)?;
        for (name, value) in &captured {
            tracing::info!(step = %call.label, name = %name, value = %value, "captured");
            scope.insert(name.as_str(), value.as_str());
        }
        Ok(captured)
    }

    fn condition_holds(
        &self,
        condition: &Condition,
        scope: &Bindings,
        step: &str,
    ) -> Result<bool> {
        match condition {
            Condition::Published { package } => Ok(self.fresh.contains(package)),
            Condition::Equals { left, right } => {
                Ok(scope.render(left, step)? == scope.render(right, step)?)
            }
        }
    }
}

/// First `<root>/<search root>/<dir>` that exists.
pub fn locate_package(
    root: &Path,
    search_roots: &[String],
    package: &PackageSpec,
) -> Result<PathBuf> {
    let candidates = search_roots
        .iter()
        .map(|search_root| root.join(search_root).join(&package.dir))
        .collect::<Vec<_>>();
    candidates
        .iter()
        .find(|candidate| candidate.is_dir())
        .cloned()
        .ok_or_else(|| DeployError::SourceNotFound {
            package: package.name.clone(),
            candidates,
        })
}

/// Build the `call` argument list for one step.
pub fn call_args(call: &CallStep, scope: &Bindings) -> Result<Vec<String>> {
    let mut args = vec![
        "call".to_string(),
        "--package".to_string(),
        scope.render(&call.package, &call.label)?,
        "--module".to_string(),
        call.module.clone(),
        "--function".to_string(),
        call.function.clone(),
    ];
    if !call.args.is_empty() {
        args.push("--args".to_string());
        args.extend(scope.render_all(&call.args, &call.label)?);
    }
    if let Some(budget) = call.gas_budget {
        args.push("--gas-budget".to_string());
        args.push(budget.to_string());
    }
    Ok(args)
}

fn tracked_fields(package: &PackageSpec, manifest_path: &Path) -> Result<Option<AddressFields>> {
    if package.address_fields.is_empty() {
        return Ok(None);
    }
    if !manifest_path.is_file() {
        tracing::debug!(
            path = %manifest_path.display(),
            "no manifest; address fields left alone"
        );
        return Ok(None);
    }
    AddressFields::new(&package.address_fields).map(Some)
}

fn clean_build_outputs(dir: &Path, entries: &[String]) -> Result<()> {
    for entry in entries {
        let path = dir.join(entry);
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else if path.exists() {
            fs::remove_file(&path)
        } else {
            continue;
        };
        removed.map_err(|err| DeployError::io("remove", &path, err))?;
        tracing::debug!(path = %path.display(), "removed stale build output");
    }
    Ok(())
}

fn extract_captures(
    captures: &[Capture],
    document: &Value,
    context: &str,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for capture in captures {
        let value = match &capture.source {
            CaptureSource::Path { path } => Selector::parse(path)?.select_id(document, context)?,
            CaptureSource::Match {
                list,
                key,
                pattern,
                field,
            } => {
                let pattern = Regex::new(pattern).map_err(|err| {
                    DeployError::InvalidConfig(format!("capture `{}` pattern: {err}", capture.name))
                })?;
                match_in_list(document, &Selector::parse(list)?, key, &pattern, field, context)?
            }
        };
        out.insert(capture.name.clone(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{builtin_config, ModelKind, Profile};
    use serde_json::json;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Records every invocation and answers from a queue.
    #[derive(Default)]
    struct ScriptedInvoker {
        calls: Vec<Invocation>,
        responses: VecDeque<Result<Value>>,
    }

    impl ScriptedInvoker {
        fn respond(mut self, response: Result<Value>) -> Self {
            self.responses.push_back(response);
            self
        }

        fn function_calls(&self, function: &str) -> Vec<&Invocation> {
            self.calls
                .iter()
                .filter(|call| call.args.iter().any(|arg| arg == function))
                .collect()
        }
    }

    impl CommandInvoker for ScriptedInvoker {
        fn invoke(&mut self, invocation: &Invocation) -> Result<Value> {
            self.calls.push(invocation.clone());
            self.responses
                .pop_front()
                .unwrap_or_else(|| Ok(json!({ "events": [] })))
        }
    }

    fn publish_result() -> Value {
        json!({
            "events": [{
                "packageId": "0xpkg",
                "parsedJson": { "db": "0xdb", "manager_badge": "0xmgr" }
            }]
        })
    }

    fn register_result() -> Value {
        json!({
            "events": [{
                "parsedJson": { "badge_id": "0xbadge", "node_small_id": { "inner": 4 } }
            }]
        })
    }

    fn task_result() -> Value {
        json!({ "events": [{ "parsedJson": { "task_small_id": { "inner": 9 } } }] })
    }

    fn single_model_config() -> DeployConfig {
        let mut config = builtin_config(Profile::Node);
        config.models = vec![ModelSpec {
            name: "m1".to_string(),
            kind: ModelKind::Text2Text,
            echelon: 1,
        }];
        config
    }

    fn workspace() -> TempDir {
        let root = TempDir::new().unwrap();
        let package = root.path().join("sui/packages/atoma");
        fs::create_dir_all(&package).unwrap();
        fs::write(
            package.join("Move.toml"),
            "[package]\npublished-at = \"0xold\"\n\n[addresses]\natoma = \"0xold\"\n",
        )
        .unwrap();
        root
    }

    fn happy_invoker() -> ScriptedInvoker {
        ScriptedInvoker::default()
            .respond(Ok(publish_result()))
            .respond(Ok(register_result()))
            .respond(Ok(json!({})))
            .respond(Ok(json!({})))
            .respond(Ok(task_result()))
            .respond(Ok(json!({})))
    }

    #[test]
    fn threads_identifiers_through_the_call_chain() {
        let root = workspace();
        let mut invoker = happy_invoker();
        let report = Orchestrator::new(&mut invoker, root.path())
            .run(&single_model_config())
            .unwrap();

        let functions: Vec<_> = invoker
            .calls
            .iter()
            .map(|call| {
                call.args
                    .iter()
                    .skip_while(|arg| *arg != "--function")
                    .nth(1)
                    .cloned()
                    .unwrap_or_else(|| call.subcommand().to_string())
            })
            .collect();
        assert_eq!(
            functions,
            [
                "publish",
                "register_node_entry",
                "add_model_entry",
                "add_model_echelon_entry",
                "create_task_entry",
                "subscribe_node_to_task"
            ]
        );

        let create = invoker.function_calls("create_task_entry")[0];
        assert!(create.args.contains(&"[\"m1\"]".to_string()));
        assert!(create.args.contains(&"0xdb".to_string()));

        let subscribe = invoker.function_calls("subscribe_node_to_task")[0];
        let tail: Vec<_> = subscribe
            .args
            .iter()
            .skip_while(|arg| *arg != "--args")
            .skip(1)
            .cloned()
            .collect();
        assert_eq!(tail, ["0xdb", "0xbadge", "9", "10000000"]);

        let lines: Vec<_> = report
            .lines
            .iter()
            .map(|line| (line.label.as_str(), line.value.as_str()))
            .collect();
        assert!(lines.contains(&("Badge_id", "0xbadge")));
        assert!(lines.contains(&("Small_id", "4")));
        assert_eq!(report.models[0].captures["task_small_id"], "9");
    }

    #[test]
    fn publish_runs_in_package_dir_and_pins_manifest() {
        let root = workspace();
        let package = root.path().join("sui/packages/atoma");
        fs::create_dir_all(package.join("build")).unwrap();
        fs::write(package.join("Move.lock"), "lock").unwrap();
        let mut invoker = happy_invoker();
        Orchestrator::new(&mut invoker, root.path())
            .run(&single_model_config())
            .unwrap();

        assert_eq!(invoker.calls[0].subcommand(), "publish");
        assert_eq!(invoker.calls[0].cwd.as_deref(), Some(package.as_path()));
        assert!(!package.join("build").exists());
        assert!(!package.join("Move.lock").exists());
        let manifest = fs::read_to_string(package.join("Move.toml")).unwrap();
        assert!(manifest.contains("published-at = \"0xpkg\""));
        assert!(manifest.contains("atoma = \"0xpkg\""));
        assert!(package.join("atoma_build.json").is_file());
    }

    #[test]
    fn second_run_reuses_cached_publish() {
        let root = workspace();
        let mut first = happy_invoker();
        Orchestrator::new(&mut first, root.path())
            .run(&single_model_config())
            .unwrap();

        let mut second = ScriptedInvoker::default()
            .respond(Ok(register_result()))
            .respond(Ok(json!({})))
            .respond(Ok(json!({})))
            .respond(Ok(task_result()))
            .respond(Ok(json!({})));
        let report = Orchestrator::new(&mut second, root.path())
            .run(&single_model_config())
            .unwrap();
        assert!(second.calls.iter().all(|call| call.subcommand() != "publish"));
        assert!(!report.packages[0].published);
        assert_eq!(report.packages[0].captures["atoma_package"], "0xpkg");
    }

    #[test]
    fn failed_publish_propagates_and_leaves_no_cache() {
        let root = workspace();
        let mut invoker = ScriptedInvoker::default().respond(Err(DeployError::ExternalCommand {
            command: "sui client publish --json".to_string(),
            status: "exit status: 1".to_string(),
            stdout: String::new(),
            stderr: "network unreachable".to_string(),
        }));
        let err = Orchestrator::new(&mut invoker, root.path())
            .run(&single_model_config())
            .unwrap_err();
        assert!(matches!(err, DeployError::ExternalCommand { .. }));
        assert!(!root
            .path()
            .join("sui/packages/atoma/atoma_build.json")
            .exists());
        assert_eq!(invoker.calls.len(), 1);
    }

    #[test]
    fn publish_without_events_is_shape_error() {
        let root = workspace();
        let mut invoker = ScriptedInvoker::default().respond(Ok(json!({ "effects": {} })));
        let err = Orchestrator::new(&mut invoker, root.path())
            .run(&single_model_config())
            .unwrap_err();
        match err {
            DeployError::UnexpectedOutputShape { missing, .. } => assert_eq!(missing, "events"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_sources_list_candidates() {
        let root = TempDir::new().unwrap();
        let mut invoker = ScriptedInvoker::default();
        let err = Orchestrator::new(&mut invoker, root.path())
            .run(&single_model_config())
            .unwrap_err();
        match err {
            DeployError::SourceNotFound { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(invoker.calls.is_empty());
    }

    #[test]
    fn first_existing_search_root_wins() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("work");
        fs::create_dir_all(root.path().join("packages/atoma")).unwrap();
        fs::create_dir_all(nested.join("sui/packages/atoma")).unwrap();
        let config = single_model_config();
        let found = locate_package(&nested, &config.search_roots, &config.packages[0]).unwrap();
        assert_eq!(found, nested.join("../packages").join("atoma"));
    }

    #[test]
    fn conditions_gate_steps() {
        let mut config = builtin_config(Profile::TokenNode);
        config.models.truncate(1);
        let root = workspace();
        fs::create_dir_all(root.path().join("sui/packages/toma")).unwrap();
        let toma_publish = json!({
            "events": [{
                "packageId": "0xtoma",
                "parsedJson": { "faucet": "0xfaucet", "treasury": "0xtreasury" }
            }]
        });
        let faucet = json!({
            "objectChanges": [
                { "objectType": "0x2::coin::Coin<0xbeef::toma::TOMA>", "objectId": "0xwallet" }
            ]
        });
        let mut invoker = ScriptedInvoker::default()
            .respond(Ok(toma_publish))
            .respond(Ok(publish_result()))
            .respond(Ok(json!({})))
            .respond(Ok(faucet))
            .respond(Ok(register_result()))
            .respond(Ok(json!({})))
            .respond(Ok(json!({})))
            .respond(Ok(task_result()))
            .respond(Ok(json!({})))
            .respond(Ok(json!({})));
        let report = Orchestrator::new(&mut invoker, root.path())
            .run(&config)
            .unwrap();

        assert_eq!(invoker.function_calls("enable_faucet").len(), 1);
        let register = invoker.function_calls("register_node_entry")[0];
        assert!(register.args.contains(&"0xwallet".to_string()));
        assert_eq!(invoker.function_calls("add_node_to_model").len(), 1);
        assert_eq!(report.lines[0].value, "0xtoma");
    }

    #[test]
    fn unmet_conditions_skip_steps() {
        let mut config = builtin_config(Profile::TokenNode);
        config.models = vec![ModelSpec {
            name: "m2".to_string(),
            kind: ModelKind::Text2Text,
            echelon: 2,
        }];
        let root = workspace();
        let toma_dir = root.path().join("sui/packages/toma");
        fs::create_dir_all(&toma_dir).unwrap();
        let cached = json!({
            "events": [{
                "packageId": "0xtoma",
                "parsedJson": { "faucet": "0xfaucet", "treasury": "0xtreasury" }
            }]
        });
        fs::write(
            toma_dir.join("toma_build.json"),
            serde_json::to_string_pretty(&cached).unwrap(),
        )
        .unwrap();
        let faucet = json!({
            "objectChanges": [
                { "objectType": "0x2::coin::Coin<0xbeef::toma::TOMA>", "objectId": "0xwallet" }
            ]
        });
        let mut invoker = ScriptedInvoker::default()
            .respond(Ok(publish_result()))
            .respond(Ok(faucet))
            .respond(Ok(register_result()))
            .respond(Ok(json!({})))
            .respond(Ok(json!({})))
            .respond(Ok(task_result()))
            .respond(Ok(json!({})));
        let report = Orchestrator::new(&mut invoker, root.path())
            .run(&config)
            .unwrap();

        assert!(invoker.function_calls("enable_faucet").is_empty());
        assert!(invoker.function_calls("add_node_to_model").is_empty());
        assert_eq!(invoker.calls.len(), 7);
        assert_eq!(
            invoker
                .calls
                .iter()
                .filter(|call| call.subcommand() == "publish")
                .count(),
            1
        );
        assert!(!report.packages[0].published);
        assert!(report.packages[1].published);
        assert_eq!(report.lines[0].value, "0xtoma");
    }

    #[test]
    fn call_args_keep_tokens_whole() {
        let mut scope = Bindings::new();
        scope.insert("atoma_package", "0xpkg");
        scope.insert("model.name", "name with spaces");
        let call = CallStep {
            label: "add model".to_string(),
            package: "{atoma_package}".to_string(),
            module: "db".to_string(),
            function: "add_model_entry".to_string(),
            args: vec!["{model.name}".to_string()],
            gas_budget: Some(5),
            captures: Vec::new(),
            when: None,
        };
        assert_eq!(
            call_args(&call, &scope).unwrap(),
            [
                "call",
                "--package",
                "0xpkg",
                "--module",
                "db",
                "--function",
                "add_model_entry",
                "--args",
                "name with spaces",
                "--gas-budget",
                "5"
            ]
        );
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The JSON ruleset file and its compilation into an `Engine`. Every plugin
//! is instantiated and init'ed at compile time so a bad config dies at
//! startup with a pointer at the offending plugin.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::engine::ConstructionContext;
use crate::engine::DetectorGroup;
use crate::engine::Engine;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::Ruleset;
use crate::plugins;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Deserialize)]
pub struct ConfigRoot {
    pub rulesets: Vec<RulesetConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RulesetConfig {
    pub name: String,
    pub detector_groups: Vec<DetectorGroupConfig>,
    pub actions: Vec<PluginConfig>,
}

#[derive(Debug, Deserialize)]
pub struct DetectorGroupConfig {
    pub name: String,
    pub detectors: Vec<PluginConfig>,
}

#[derive(Debug, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

pub fn parse(contents: &str) -> Result<ConfigRoot, Error> {
    Ok(serde_json::from_str(contents)?)
}

fn compile_plugin(
    resources: &mut MonitoredResources,
    config: &PluginConfig,
    construction: &ConstructionContext,
) -> Result<Box<dyn Plugin>, Error> {
    if config.name.is_empty() {
        return Err(Error::InvalidConfig("plugin is missing a name".to_owned()));
    }

    let Some(mut plugin) = plugins::create(&config.name) else {
        return Err(Error::InvalidConfig(format!(
            "no plugin named \"{}\"",
            config.name
        )));
    };

    plugin
        .init(resources, &config.args, construction)
        .map_err(|e| {
            Error::InvalidConfig(format!("plugin \"{}\" failed to init: {:#}", config.name, e))
        })?;

    Ok(plugin)
}

pub fn compile(root: &ConfigRoot, construction: &ConstructionContext) -> Result<Engine, Error> {
    let mut resources = MonitoredResources::new();
    let mut rulesets = Vec::new();

    if root.rulesets.is_empty() {
        return Err(Error::InvalidConfig("no rulesets configured".to_owned()));
    }

    for ruleset in &root.rulesets {
        if ruleset.name.is_empty() {
            return Err(Error::InvalidConfig("ruleset is missing a name".to_owned()));
        }
        if ruleset.detector_groups.is_empty() || ruleset.actions.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "ruleset \"{}\" is missing detector groups or actions",
                ruleset.name
            )));
        }

        let mut detector_groups = Vec::new();
        for group in &ruleset.detector_groups {
            if group.name.is_empty() || group.detectors.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "detector group in ruleset \"{}\" is empty or unnamed",
                    ruleset.name
                )));
            }
            let mut detectors = Vec::new();
            for detector in &group.detectors {
                detectors.push(compile_plugin(&mut resources, detector, construction)?);
            }
            detector_groups.push(DetectorGroup::new(group.name.clone(), detectors));
        }

        let mut actions = Vec::new();
        for action in &ruleset.actions {
            actions.push(compile_plugin(&mut resources, action, construction)?);
        }

        rulesets.push(Ruleset::new(
            ruleset.name.clone(),
            detector_groups,
            actions,
        ));
    }

    Ok(Engine::new(resources, rulesets))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const CONFIG: &str = r#"
    {
      "rulesets": [
        {
          "name": "memory pressure protection",
          "detector_groups": [
            {
              "name": "system under pressure",
              "detectors": [
                {
                  "name": "pressure_above",
                  "args": {
                    "cgroup": "workload.slice",
                    "resource": "memory",
                    "threshold": "80",
                    "duration": "30"
                  }
                },
                {
                  "name": "memory_reclaim",
                  "args": { "duration": "10" }
                }
              ]
            }
          ],
          "actions": [
            {
              "name": "kill_by_memory_size_or_growth",
              "args": { "cgroup": "workload.slice/*", "post_action_delay": "15" }
            }
          ]
        }
      ]
    }
    "#;

    fn construction() -> ConstructionContext {
        ConstructionContext {
            cgroup_fs: PathBuf::from("/sys/fs/cgroup"),
            dry: false,
        }
    }

    #[test]
    fn test_parse_and_compile() {
        let root = parse(CONFIG).unwrap();
        assert_eq!(root.rulesets.len(), 1);
        assert_eq!(root.rulesets[0].detector_groups[0].detectors.len(), 2);

        let engine = compile(&root, &construction()).unwrap();
        // pressure_above registers workload.slice, the kill plugin registers
        // workload.slice/*.
        assert_eq!(engine.monitored_resources().len(), 2);
    }

    #[test]
    fn test_unknown_plugin_is_invalid() {
        let root = parse(
            r#"{ "rulesets": [ { "name": "r", "detector_groups": [
                 { "name": "g", "detectors": [ { "name": "not_a_plugin" } ] } ],
                 "actions": [ { "name": "stop" } ] } ] }"#,
        )
        .unwrap();
        assert!(matches!(
            compile(&root, &construction()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_plugin_missing_args_is_invalid() {
        // pressure_above without its required args must fail compilation.
        let root = parse(
            r#"{ "rulesets": [ { "name": "r", "detector_groups": [
                 { "name": "g", "detectors": [ { "name": "pressure_above" } ] } ],
                 "actions": [ { "name": "stop" } ] } ] }"#,
        )
        .unwrap();
        let err = compile(&root, &construction()).unwrap_err();
        assert!(err.to_string().contains("pressure_above"));
    }

    #[test]
    fn test_empty_ruleset_is_invalid() {
        let root = parse(r#"{ "rulesets": [] }"#).unwrap();
        assert!(compile(&root, &construction()).is_err());

        let root = parse(
            r#"{ "rulesets": [ { "name": "r", "detector_groups": [], "actions": [] } ] }"#,
        )
        .unwrap();
        assert!(compile(&root, &construction()).is_err());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(parse("{ not json"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_compiled_engine_runs_end_to_end() {
        use crate::cgroup_path::CgroupPath;
        use crate::context::CgroupContext;
        use crate::context::OomdContext;

        // A workload cgroup showing up in the snapshot triggers an in-memory
        // usage adjustment on it.
        let root = parse(
            r#"{ "rulesets": [ { "name": "discount workload", "detector_groups": [
                 { "name": "workload present", "detectors": [
                   { "name": "exists", "args": { "cgroup": "workload/*" } } ] } ],
                 "actions": [
                   { "name": "adjust_cgroup",
                     "args": { "cgroup": "workload/*", "memory": "-512" } } ] } ] }"#,
        )
        .unwrap();
        let mut engine = compile(&root, &construction()).unwrap();

        let app = CgroupPath::new("/sys/fs/cgroup", "workload/app");
        let mut ctx = OomdContext::new();
        ctx.set(
            app.clone(),
            CgroupContext {
                current_usage: 4096,
                ..Default::default()
            },
        );

        engine.run_once(&mut ctx);
        assert_eq!(ctx.get(&app).unwrap().effective_usage(), 4096 - 512);
        assert_eq!(ctx.action_context().ruleset, "discount workload");
        assert_eq!(ctx.action_context().detector_group, "workload present");

        // Without the workload the detector group never fires and the
        // snapshot is untouched.
        let mut ctx = OomdContext::new();
        ctx.set(
            CgroupPath::new("/sys/fs/cgroup", "system/app"),
            CgroupContext {
                current_usage: 4096,
                ..Default::default()
            },
        );
        engine.run_once(&mut ctx);
        assert_eq!(
            ctx.get(&CgroupPath::new("/sys/fs/cgroup", "system/app"))
                .unwrap()
                .effective_usage(),
            4096
        );
    }
}

//! Pipeline definitions and their stage dependency graph.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    adapters::ToolCatalog,
    error::{OrchestratorError, Result},
    jobs::JobState,
    models::RecordKind,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Tools that run in parallel within the stage.
    pub tools: Vec<String>,
    /// Predecessor stages. `None` means the stage listed just before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<String>>,
}

impl StageDefinition {
    pub fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            after: None,
        }
    }

    pub fn after(mut self, stages: &[&str]) -> Self {
        self.after = Some(stages.iter().map(|s| s.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<StageDefinition>,
}

/// Resolved stage edges. `predecessors[i]` lists the stages `i` waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineGraph {
    pub predecessors: Vec<Vec<usize>>,
}

impl PipelineGraph {
    /// Every stage reachable backwards from `stage`, excluding itself.
    pub fn ancestors(&self, stage: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = self.predecessors[stage].clone();
        while let Some(s) = stack.pop() {
            if seen.insert(s) {
                stack.extend(self.predecessors[s].iter().copied());
            }
        }
        seen
    }
}

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidPipeline(msg.into())
}

impl PipelineDefinition {
    /// Checks names, tools and record flow, and resolves the stage graph.
    pub fn validate(&self, catalog: &ToolCatalog) -> Result<PipelineGraph> {
        if self.stages.is_empty() {
            return Err(invalid(format!("pipeline {:?} has no stages", self.name)));
        }

        let mut index = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(invalid(format!("stage {i} has no name")));
            }
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(invalid(format!("duplicate stage {:?}", stage.name)));
            }
            if stage.tools.is_empty() {
                return Err(invalid(format!("stage {:?} has no tools", stage.name)));
            }
            let mut tools = BTreeSet::new();
            for tool in &stage.tools {
                if !catalog.contains(tool) {
                    return Err(invalid(format!("unknown tool {tool:?} in stage {:?}", stage.name)));
                }
                if !tools.insert(tool) {
                    return Err(invalid(format!("tool {tool:?} listed twice in stage {:?}", stage.name)));
                }
            }
        }

        let mut predecessors = Vec::with_capacity(self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            let preds = match &stage.after {
                None if i == 0 => vec![],
                None => vec![i - 1],
                Some(names) => {
                    let mut preds = Vec::with_capacity(names.len());
                    for name in names {
                        let &p = index.get(name.as_str()).ok_or_else(|| {
                            invalid(format!("stage {:?} depends on unknown stage {name:?}", stage.name))
                        })?;
                        if p == i {
                            return Err(invalid(format!("stage {:?} depends on itself", stage.name)));
                        }
                        if !preds.contains(&p) {
                            preds.push(p);
                        }
                    }
                    preds.sort_unstable();
                    preds
                }
            };
            predecessors.push(preds);
        }

        let graph = PipelineGraph { predecessors };
        if let Some(stage) = find_cycle(&graph) {
            return Err(invalid(format!(
                "stage {:?} is part of a dependency cycle",
                self.stages[stage].name
            )));
        }

        // Subdomains are always available: the scope itself is seeded.
        for (i, stage) in self.stages.iter().enumerate() {
            let mut available = BTreeSet::from([RecordKind::Subdomain]);
            for a in graph.ancestors(i) {
                for tool in &self.stages[a].tools {
                    available.extend(catalog.get(tool).and_then(|t| t.emits()));
                }
            }
            // A tool reading several kinds needs at least one of them.
            for tool in &stage.tools {
                let consumes = catalog.get(tool).map(|t| t.consumes()).unwrap_or_default();
                if consumes.is_empty() || consumes.iter().any(|k| available.contains(k)) {
                    continue;
                }
                let kinds: Vec<&str> = consumes.iter().map(|k| k.as_str()).collect();
                return Err(invalid(format!(
                    "tool {tool:?} in stage {:?} consumes {} records that no earlier stage produces",
                    stage.name,
                    kinds.join("/")
                )));
            }
        }

        Ok(graph)
    }
}

/// Kahn's algorithm; returns a stage left over when the graph has a cycle.
fn find_cycle(graph: &PipelineGraph) -> Option<usize> {
    let n = graph.predecessors.len();
    let mut remaining: Vec<usize> = graph.predecessors.iter().map(Vec::len).collect();
    let mut ready: Vec<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut visited = 0;
    while let Some(s) = ready.pop() {
        visited += 1;
        for (j, preds) in graph.predecessors.iter().enumerate() {
            if preds.contains(&s) {
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    ready.push(j);
                }
            }
        }
    }
    (visited < n).then(|| (0..n).find(|&i| remaining[i] > 0).unwrap_or(0))
}

/// When a stage whose predecessors are all terminal may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePolicy {
    /// At least one predecessor job succeeded.
    #[default]
    AnySucceeded,
    /// Every predecessor job succeeded.
    AllSucceeded,
}

impl StagePolicy {
    /// `states` are the final states of every job in the predecessor stages.
    /// A stage without predecessors always runs.
    pub fn allows(self, states: &[JobState]) -> bool {
        if states.is_empty() {
            return true;
        }
        match self {
            StagePolicy::AnySucceeded => states.contains(&JobState::Succeeded),
            StagePolicy::AllSucceeded => states.iter().all(|s| *s == JobState::Succeeded),
        }
    }
}

pub fn builtin() -> Vec<PipelineDefinition> {
    vec![
        PipelineDefinition {
            name: "full".into(),
            description: "subdomain enumeration, probing, crawling and vulnerability scanning".into(),
            stages: vec![
                StageDefinition::new("subdomains", &["subfinder", "assetfinder", "findomain"]),
                StageDefinition::new("probe", &["httpx"]),
                StageDefinition::new("crawl", &["katana", "gau"]),
                StageDefinition::new("vulns", &["nuclei"]).after(&["probe", "crawl"]),
            ],
        },
        PipelineDefinition {
            name: "quick".into(),
            description: "passive enumeration, probing and nuclei".into(),
            stages: vec![
                StageDefinition::new("subdomains", &["subfinder"]),
                StageDefinition::new("probe", &["httpx"]),
                StageDefinition::new("vulns", &["nuclei"]),
            ],
        },
        PipelineDefinition {
            name: "fuzz".into(),
            description: "probe the scope and fuzz live hosts with the configured wordlist".into(),
            stages: vec![
                StageDefinition::new("probe", &["httpx"]),
                StageDefinition::new("fuzz", &["ffuf"]),
            ],
        },
        PipelineDefinition {
            name: "injection".into(),
            description: "crawl live hosts, then test xss and sqli candidate urls".into(),
            stages: vec![
                StageDefinition::new("subdomains", &["subfinder"]),
                StageDefinition::new("probe", &["httpx"]),
                StageDefinition::new("crawl", &["katana", "gau"]),
                StageDefinition::new("injection", &["dalfox", "sqlmap"]),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ToolCatalog {
        ToolCatalog::builtin("common.txt")
    }

    #[test]
    fn builtins_validate() {
        let catalog = catalog();
        for pipeline in builtin() {
            pipeline.validate(&catalog).unwrap();
        }
    }

    #[test]
    fn default_edges_follow_stage_order() {
        let full = builtin().into_iter().find(|p| p.name == "full").unwrap();
        let graph = full.validate(&catalog()).unwrap();
        assert_eq!(graph.predecessors, vec![vec![], vec![0], vec![1], vec![1, 2]]);
        assert_eq!(graph.ancestors(3), BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn cycles_are_rejected() {
        let pipeline = PipelineDefinition {
            name: "loop".into(),
            description: String::new(),
            stages: vec![
                StageDefinition::new("a", &["subfinder"]).after(&["b"]),
                StageDefinition::new("b", &["gau"]).after(&["a"]),
            ],
        };
        let err = pipeline.validate(&catalog()).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn consumed_kinds_must_be_produced_upstream() {
        let pipeline = PipelineDefinition {
            name: "bad".into(),
            description: String::new(),
            stages: vec![
                StageDefinition::new("subdomains", &["subfinder"]),
                StageDefinition::new("vulns", &["nuclei"]),
            ],
        };
        let err = pipeline.validate(&catalog()).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidPipeline(_)));
        assert!(err.to_string().contains("live_host/url"), "{err}");
    }

    #[test]
    fn multi_kind_consumers_need_only_one_kind_upstream() {
        let pipeline = PipelineDefinition {
            name: "archive".into(),
            description: String::new(),
            stages: vec![
                StageDefinition::new("urls", &["gau"]),
                StageDefinition::new("vulns", &["nuclei"]),
            ],
        };
        pipeline.validate(&catalog()).unwrap();
    }

    #[test]
    fn unknown_tools_and_stages_are_rejected() {
        let unknown_tool = PipelineDefinition {
            name: "x".into(),
            description: String::new(),
            stages: vec![StageDefinition::new("s", &["masscan"])],
        };
        assert!(unknown_tool.validate(&catalog()).is_err());

        let unknown_stage = PipelineDefinition {
            name: "x".into(),
            description: String::new(),
            stages: vec![StageDefinition::new("s", &["subfinder"]).after(&["nope"])],
        };
        assert!(unknown_stage.validate(&catalog()).is_err());
    }

    #[test]
    fn stage_policies() {
        use JobState::*;
        assert!(StagePolicy::AnySucceeded.allows(&[]));
        assert!(StagePolicy::AnySucceeded.allows(&[Failed, Succeeded]));
        assert!(!StagePolicy::AnySucceeded.allows(&[Failed, Cancelled]));
        assert!(!StagePolicy::AllSucceeded.allows(&[Failed, Succeeded]));
        assert!(StagePolicy::AllSucceeded.allows(&[Succeeded, Succeeded]));
    }
}

//! Job graph validation
//!
//! The validator checks a built [`Job`] before it is registered: element ids
//! are unique across the whole graph, every `next` and transition target
//! resolves within the element list that declares it, and the static
//! successor graph of each list is acyclic unless loops are allowed.

use crate::job::{Flow, Job, JobElement, StepKind};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Errors found while validating a job graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Job {0} has no elements")]
    EmptyJob(String),

    #[error("Flow {0} has no elements")]
    EmptyFlow(String),

    #[error("Split {0} has no flows")]
    EmptySplit(String),

    #[error("Duplicate element id: {0}")]
    DuplicateId(String),

    #[error("Element {element} refers to unknown element {target}")]
    UnknownTarget { element: String, target: String },

    #[error("Circular reference among elements: {}", .0.join(", "))]
    CircularReference(Vec<String>),

    #[error("Invalid step {step}: {reason}")]
    InvalidStep { step: String, reason: String },
}

/// Validates job graphs
#[derive(Debug, Clone, Default)]
pub struct JobValidator {
    allow_loops: bool,
}

impl JobValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept cyclic successor graphs
    pub fn allow_loops(mut self, allow: bool) -> Self {
        self.allow_loops = allow;
        self
    }

    pub fn validate(&self, job: &Job) -> Result<(), ValidationError> {
        if job.elements.is_empty() {
            return Err(ValidationError::EmptyJob(job.id.clone()));
        }

        let mut all_ids = HashSet::new();
        collect_ids(&job.elements, &mut all_ids)?;

        // Restart positions name top-level elements
        let top_level: HashSet<String> = job.elements.iter().map(|e| e.id().to_string()).collect();
        self.validate_list(&job.elements, &top_level)
    }

    fn validate_list(
        &self,
        elements: &[JobElement],
        top_level: &HashSet<String>,
    ) -> Result<(), ValidationError> {
        let local: HashSet<&str> = elements.iter().map(JobElement::id).collect();

        for element in elements {
            for target in successors(element) {
                if !local.contains(target) {
                    return Err(ValidationError::UnknownTarget {
                        element: element.id().to_string(),
                        target: target.to_string(),
                    });
                }
            }

            for transition in element.transitions() {
                if let crate::transition::Transition::Stop {
                    restart: Some(restart),
                    ..
                } = transition
                {
                    if !top_level.contains(restart) {
                        return Err(ValidationError::UnknownTarget {
                            element: element.id().to_string(),
                            target: restart.clone(),
                        });
                    }
                }
            }

            match element {
                JobElement::Step(step) => {
                    if let StepKind::Chunk {
                        item_count: Some(0),
                        ..
                    } = step.kind
                    {
                        return Err(ValidationError::InvalidStep {
                            step: step.id.clone(),
                            reason: "item count must be positive".to_string(),
                        });
                    }
                    if let Some(partition) = &step.partition {
                        match (&partition.plan, &partition.mapper) {
                            (None, None) => {
                                return Err(ValidationError::InvalidStep {
                                    step: step.id.clone(),
                                    reason: "partition needs a plan or a mapper".to_string(),
                                })
                            }
                            (Some(plan), _) => plan.validate().map_err(|reason| {
                                ValidationError::InvalidStep {
                                    step: step.id.clone(),
                                    reason,
                                }
                            })?,
                            _ => {}
                        }
                    }
                }
                JobElement::Flow(flow) => self.validate_flow(flow, top_level)?,
                JobElement::Split(split) => {
                    if split.flows.is_empty() {
                        return Err(ValidationError::EmptySplit(split.id.clone()));
                    }
                    for flow in &split.flows {
                        self.validate_flow(flow, top_level)?;
                    }
                }
                JobElement::Decision(_) => {}
            }
        }

        if !self.allow_loops {
            check_acyclic(elements)?;
        }

        Ok(())
    }

    fn validate_flow(&self, flow: &Flow, top_level: &HashSet<String>) -> Result<(), ValidationError> {
        if flow.elements.is_empty() {
            return Err(ValidationError::EmptyFlow(flow.id.clone()));
        }
        self.validate_list(&flow.elements, top_level)
    }
}

fn collect_ids(elements: &[JobElement], ids: &mut HashSet<String>) -> Result<(), ValidationError> {
    for element in elements {
        if !ids.insert(element.id().to_string()) {
            return Err(ValidationError::DuplicateId(element.id().to_string()));
        }
        match element {
            JobElement::Flow(flow) => collect_ids(&flow.elements, ids)?,
            JobElement::Split(split) => {
                for flow in &split.flows {
                    if !ids.insert(flow.id.clone()) {
                        return Err(ValidationError::DuplicateId(flow.id.clone()));
                    }
                    collect_ids(&flow.elements, ids)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Static successors: the `next` attribute plus every `next` transition target
fn successors(element: &JobElement) -> Vec<&str> {
    let mut targets: Vec<&str> = element.next().into_iter().collect();
    for transition in element.transitions() {
        if let crate::transition::Transition::Next { to, .. } = transition {
            targets.push(to);
        }
    }
    targets
}

fn check_acyclic(elements: &[JobElement]) -> Result<(), ValidationError> {
    let mut indegree: HashMap<&str, usize> = elements.iter().map(|e| (e.id(), 0)).collect();
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();

    for element in elements {
        for target in successors(element) {
            graph.entry(element.id()).or_default().push(target);
            if let Some(degree) = indegree.get_mut(target) {
                *degree += 1;
            }
        }
    }

    // Kahn's algorithm; whatever is left over sits on a cycle
    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter_map(|(id, &deg)| if deg == 0 { Some(*id) } else { None })
        .collect();
    let mut visited = 0usize;

    while let Some(id) = ready.pop_front() {
        visited += 1;
        for child in graph.get(id).into_iter().flatten() {
            if let Some(entry) = indegree.get_mut(child) {
                *entry -= 1;
                if *entry == 0 {
                    ready.push_back(*child);
                }
            }
        }
    }

    if visited != elements.len() {
        let mut remaining: Vec<String> = indegree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        remaining.sort();
        return Err(ValidationError::CircularReference(remaining));
    }

    Ok(())
}

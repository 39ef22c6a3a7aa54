//! Job graph model
//!
//! A [`Job`] is an ordered list of elements. Control starts at the first
//! element and follows each element's transitions, falling back to its `next`
//! attribute. Flows nest element lists; splits run several flows at once.
//!
//! Collaborators are referenced by artifact name and resolved through an
//! [`ArtifactFactory`](crate::artifacts::ArtifactFactory) when the job runs.

use crate::partition::PartitionConfig;
use crate::transition::Transition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String properties attached to jobs, steps, partitions and job parameters
pub type Properties = BTreeMap<String, String>;

/// A named, reusable graph of steps, decisions, flows and splits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    /// Whether failed or stopped executions may be restarted
    #[serde(default = "default_true")]
    pub restartable: bool,

    #[serde(default)]
    pub properties: Properties,

    /// `JobListener` artifact names
    #[serde(default)]
    pub listeners: Vec<String>,

    pub elements: Vec<JobElement>,
}

fn default_true() -> bool {
    true
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            restartable: true,
            properties: Properties::new(),
            listeners: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: impl Into<JobElement>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn with_listener(mut self, listener: impl Into<String>) -> Self {
        self.listeners.push(listener.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    /// Find a step definition anywhere in the graph, including inside flows and splits
    pub fn find_step(&self, id: &str) -> Option<&Step> {
        find_step_in(&self.elements, id)
    }
}

fn find_step_in<'a>(elements: &'a [JobElement], id: &str) -> Option<&'a Step> {
    for element in elements {
        match element {
            JobElement::Step(step) if step.id == id => return Some(step),
            JobElement::Flow(flow) => {
                if let Some(step) = find_step_in(&flow.elements, id) {
                    return Some(step);
                }
            }
            JobElement::Split(split) => {
                for flow in &split.flows {
                    if let Some(step) = find_step_in(&flow.elements, id) {
                        return Some(step);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// One node of the job graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobElement {
    Step(Step),
    Decision(Decision),
    Flow(Flow),
    Split(Split),
}

impl JobElement {
    pub fn id(&self) -> &str {
        match self {
            JobElement::Step(s) => &s.id,
            JobElement::Decision(d) => &d.id,
            JobElement::Flow(f) => &f.id,
            JobElement::Split(s) => &s.id,
        }
    }

    /// Static successor; decisions have none
    pub fn next(&self) -> Option<&str> {
        match self {
            JobElement::Step(s) => s.next.as_deref(),
            JobElement::Decision(_) => None,
            JobElement::Flow(f) => f.next.as_deref(),
            JobElement::Split(s) => s.next.as_deref(),
        }
    }

    pub fn transitions(&self) -> &[Transition] {
        match self {
            JobElement::Step(s) => &s.transitions,
            JobElement::Decision(d) => &d.transitions,
            JobElement::Flow(f) => &f.transitions,
            JobElement::Split(_) => &[],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobElement::Step(_) => "step",
            JobElement::Decision(_) => "decision",
            JobElement::Flow(_) => "flow",
            JobElement::Split(_) => "split",
        }
    }
}

impl From<Step> for JobElement {
    fn from(step: Step) -> Self {
        JobElement::Step(step)
    }
}

impl From<Decision> for JobElement {
    fn from(decision: Decision) -> Self {
        JobElement::Decision(decision)
    }
}

impl From<Flow> for JobElement {
    fn from(flow: Flow) -> Self {
        JobElement::Flow(flow)
    }
}

impl From<Split> for JobElement {
    fn from(split: Split) -> Self {
        JobElement::Split(split)
    }
}

/// Step body: a single task, or a read-process-write chunk loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Batchlet {
        batchlet: String,
    },
    Chunk {
        reader: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processor: Option<String>,
        writer: String,
        /// Items per checkpoint; falls back to the runtime default
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_count: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default)]
    pub transitions: Vec<Transition>,

    /// Rerun on restart even when the previous run completed
    #[serde(default)]
    pub allow_start_if_complete: bool,

    /// Maximum starts within one job instance; 0 means unlimited
    #[serde(default)]
    pub start_limit: u32,

    #[serde(default)]
    pub properties: Properties,

    /// `StepListener` artifact names
    #[serde(default)]
    pub listeners: Vec<String>,

    pub kind: StepKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionConfig>,
}

impl Step {
    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: Vec::new(),
            allow_start_if_complete: false,
            start_limit: 0,
            properties: Properties::new(),
            listeners: Vec::new(),
            kind,
            partition: None,
        }
    }

    pub fn batchlet(id: impl Into<String>, batchlet: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Batchlet {
                batchlet: batchlet.into(),
            },
        )
    }

    pub fn chunk(id: impl Into<String>, reader: impl Into<String>, writer: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Chunk {
                reader: reader.into(),
                processor: None,
                writer: writer.into(),
                item_count: None,
            },
        )
    }

    /// Set the processor of a chunk step; ignored for batchlets
    pub fn with_processor(mut self, name: impl Into<String>) -> Self {
        if let StepKind::Chunk { processor, .. } = &mut self.kind {
            *processor = Some(name.into());
        }
        self
    }

    /// Set the checkpoint interval of a chunk step; ignored for batchlets
    pub fn with_item_count(mut self, count: usize) -> Self {
        if let StepKind::Chunk { item_count, .. } = &mut self.kind {
            *item_count = Some(count);
        }
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_listener(mut self, listener: impl Into<String>) -> Self {
        self.listeners.push(listener.into());
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn with_start_limit(mut self, limit: u32) -> Self {
        self.start_limit = limit;
        self
    }

    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition.is_some()
    }
}

/// Routes control by the exit status a `Decider` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,

    /// `Decider` artifact name
    pub decider: String,

    #[serde(default)]
    pub properties: Properties,

    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Decision {
    pub fn new(id: impl Into<String>, decider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            decider: decider.into(),
            properties: Properties::new(),
            transitions: Vec::new(),
        }
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A nested element list walked with the same rules as the job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default)]
    pub transitions: Vec<Transition>,

    pub elements: Vec<JobElement>,
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: impl Into<JobElement>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }
}

/// Flows that run concurrently; the split ends when all of them have ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    pub flows: Vec<Flow>,
}

impl Split {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            flows: Vec::new(),
        }
    }

    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }
}

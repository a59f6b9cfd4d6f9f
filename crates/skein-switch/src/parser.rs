//! Compiles a logical "from these sources to these targets" request into
//! per-node plans.
//!
//! Parsing runs in two passes. The first builds a logical stream graph:
//! sources, an optional split of the whole object, one erasure-coding step
//! producing every derived shard, an optional join, and the targets. Node
//! sources are only materialized when something reads them. The second pass
//! emits operations: a stream read by several consumers is cloned where it
//! is produced, a stream nobody reads is discarded, and every edge that
//! crosses locations becomes a transfer pair.

use crate::builder::{CompiledPlan, PlanBuilder, ReadHandle, WriteHandle};
use crate::error::{Result, SwitchError};
use crate::ops::Op;
use crate::plan::{Location, NodeId, PlanId};
use crate::var::VarId;
use serde::{Deserialize, Serialize};
use skein_ec::MAX_TOTAL_SHARDS;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Durability scheme of the object being moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Redundancy {
    /// Whole-object replicas
    Rep,
    /// `k` data shards plus `n - k` parity shards, striped in `chunk_size` blocks
    Ec { k: usize, n: usize, chunk_size: usize },
}

/// Where data comes from. `index: None` is the whole object, `Some(i)` is
/// shard `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Driver {
        index: Option<usize>,
    },
    Node {
        node: NodeId,
        file_hash: String,
        index: Option<usize>,
    },
}

impl Source {
    pub fn driver() -> Self {
        Source::Driver { index: None }
    }

    pub fn driver_shard(index: usize) -> Self {
        Source::Driver { index: Some(index) }
    }

    pub fn node(node: NodeId, file_hash: impl Into<String>) -> Self {
        Source::Node {
            node,
            file_hash: file_hash.into(),
            index: None,
        }
    }

    pub fn node_shard(node: NodeId, file_hash: impl Into<String>, index: usize) -> Self {
        Source::Node {
            node,
            file_hash: file_hash.into(),
            index: Some(index),
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            Source::Driver { index } | Source::Node { index, .. } => *index,
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Source::Driver { .. } => Location::Driver,
            Source::Node { node, .. } => Location::Node(*node),
        }
    }
}

/// Where data goes. Node targets store a blob and publish its hash under
/// `result_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Driver {
        index: Option<usize>,
    },
    Node {
        node: NodeId,
        index: Option<usize>,
        result_key: String,
    },
}

impl Target {
    pub fn driver() -> Self {
        Target::Driver { index: None }
    }

    pub fn driver_shard(index: usize) -> Self {
        Target::Driver { index: Some(index) }
    }

    pub fn node(node: NodeId, result_key: impl Into<String>) -> Self {
        Target::Node {
            node,
            index: None,
            result_key: result_key.into(),
        }
    }

    pub fn node_shard(node: NodeId, index: usize, result_key: impl Into<String>) -> Self {
        Target::Node {
            node,
            index: Some(index),
            result_key: result_key.into(),
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            Target::Driver { index } | Target::Node { index, .. } => *index,
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Target::Driver { .. } => Location::Driver,
            Target::Node { node, .. } => Location::Node(*node),
        }
    }
}

/// A data-movement request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FromTo {
    pub sources: Vec<Source>,
    pub targets: Vec<Target>,
    /// Size of the whole object; joins truncate their output to it
    pub object_size: Option<u64>,
}

impl FromTo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, source: Source) -> Self {
        self.sources.push(source);
        self
    }

    pub fn to(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_object_size(mut self, size: u64) -> Self {
        self.object_size = Some(size);
        self
    }
}

/// Compiled plan plus the driver handles, in the order the driver sources
/// and driver targets were given
#[derive(Debug)]
pub struct ParsedPlan {
    pub plan: CompiledPlan,
    pub writes: Vec<WriteHandle>,
    pub reads: Vec<ReadHandle>,
}

/// Turns a [`FromTo`] into a [`CompiledPlan`]
#[derive(Debug, Clone)]
pub struct Parser {
    redundancy: Redundancy,
    compute_at: Option<Location>,
}

impl Parser {
    pub fn new(redundancy: Redundancy) -> Self {
        Self {
            redundancy,
            compute_at: None,
        }
    }

    /// Run split, erasure coding and join at `at`. By default they run on
    /// the driver when the driver takes part, otherwise at the first target.
    pub fn compute_at(mut self, at: Location) -> Self {
        self.compute_at = Some(at);
        self
    }

    pub fn parse(&self, request: &FromTo) -> Result<ParsedPlan> {
        self.parse_with_id(request, PlanId::new())
    }

    pub fn parse_with_id(&self, request: &FromTo, id: PlanId) -> Result<ParsedPlan> {
        self.validate(request)?;
        let compute_at = self.compute_at.unwrap_or_else(|| default_compute_at(request));
        let mut graph = Graph::new(self.redundancy, compute_at, &request.sources);
        for target in &request.targets {
            graph.plan_target(target)?;
        }
        graph.resolve_derived()?;
        for target in &request.targets {
            graph.wire_target(target)?;
        }
        let parsed = graph.emit(PlanBuilder::with_id(id), request.object_size);
        debug!(
            plan = %parsed.plan.id,
            nodes = parsed.plan.agents.len(),
            ops = parsed.plan.op_count(),
            "plan compiled"
        );
        Ok(parsed)
    }

    fn validate(&self, request: &FromTo) -> Result<()> {
        if request.sources.is_empty() {
            return Err(SwitchError::InvalidPlan("no sources".into()));
        }
        if request.targets.is_empty() {
            return Err(SwitchError::InvalidPlan("no targets".into()));
        }

        let indices = request
            .sources
            .iter()
            .map(Source::index)
            .chain(request.targets.iter().map(Target::index));

        match self.redundancy {
            Redundancy::Rep => {
                if indices.clone().any(|i| i.is_some()) {
                    return Err(SwitchError::InvalidPlan(
                        "shard indices need erasure coding".into(),
                    ));
                }
            }
            Redundancy::Ec { k, n, chunk_size } => {
                if k == 0 || k >= n {
                    return Err(SwitchError::InvalidPlan(format!(
                        "erasure code needs 0 < k < n, got k={} n={}",
                        k, n
                    )));
                }
                if n > MAX_TOTAL_SHARDS {
                    return Err(SwitchError::InvalidPlan(format!(
                        "n={} exceeds the codec limit of {}",
                        n, MAX_TOTAL_SHARDS
                    )));
                }
                if chunk_size == 0 || chunk_size % 2 != 0 {
                    return Err(SwitchError::InvalidPlan(format!(
                        "chunk size {} must be positive and even",
                        chunk_size
                    )));
                }
                if let Some(bad) = indices.clone().flatten().find(|i| *i >= n) {
                    return Err(SwitchError::InvalidPlan(format!(
                        "shard index {} out of range for n={}",
                        bad, n
                    )));
                }
            }
        }

        let mut seen = BTreeSet::new();
        for index in request.sources.iter().filter_map(Source::index) {
            if !seen.insert(index) {
                return Err(SwitchError::InvalidPlan(format!(
                    "shard {} is given by more than one source",
                    index
                )));
            }
        }
        Ok(())
    }
}

fn default_compute_at(request: &FromTo) -> Location {
    let driver_involved = request
        .sources
        .iter()
        .any(|s| s.location() == Location::Driver)
        || request
            .targets
            .iter()
            .any(|t| t.location() == Location::Driver);
    if driver_involved {
        Location::Driver
    } else {
        request
            .targets
            .first()
            .map(Target::location)
            .unwrap_or(Location::Driver)
    }
}

type Sid = usize;

/// A step of the logical graph
enum Step {
    FromDriver { out: Sid, slot: usize },
    BlobRead { node: NodeId, hash: String, out: Sid },
    Split { input: Sid, outs: Vec<Sid> },
    Compute { inputs: Vec<(Sid, usize)>, outs: Vec<(Sid, usize)> },
    Join { inputs: Vec<Sid>, out: Sid },
    ToDriver { input: Sid, slot: usize },
    ToBlob { node: NodeId, input: Sid, key: String },
}

impl Step {
    fn inputs(&self) -> Vec<Sid> {
        match self {
            Step::FromDriver { .. } | Step::BlobRead { .. } => vec![],
            Step::Split { input, .. } | Step::ToDriver { input, .. } | Step::ToBlob { input, .. } => {
                vec![*input]
            }
            Step::Compute { inputs, .. } => inputs.iter().map(|(s, _)| *s).collect(),
            Step::Join { inputs, .. } => inputs.clone(),
        }
    }
}

/// How one shard reaches a target
#[derive(Clone, Copy)]
enum ShardRoute {
    Source(usize),
    Split(usize),
    Derived(usize),
}

struct Graph<'a> {
    redundancy: Redundancy,
    compute_at: Location,
    sources: &'a [Source],
    stream_at: Vec<Location>,
    steps: Vec<(Location, Step)>,
    materialized: Vec<Option<Sid>>,
    writes: usize,
    reads: usize,
    needs_split: bool,
    derived_wanted: BTreeSet<usize>,
    split: Option<Vec<Sid>>,
    derived: HashMap<usize, Sid>,
    join: Option<Sid>,
}

impl<'a> Graph<'a> {
    fn new(redundancy: Redundancy, compute_at: Location, sources: &'a [Source]) -> Self {
        let mut graph = Self {
            redundancy,
            compute_at,
            sources,
            stream_at: Vec::new(),
            steps: Vec::new(),
            materialized: vec![None; sources.len()],
            writes: 0,
            reads: 0,
            needs_split: false,
            derived_wanted: BTreeSet::new(),
            split: None,
            derived: HashMap::new(),
            join: None,
        };
        // driver sources are always materialized: the caller writes them
        for (i, source) in sources.iter().enumerate() {
            if matches!(source, Source::Driver { .. }) {
                graph.source_stream(i);
            }
        }
        graph
    }

    fn k(&self) -> usize {
        match self.redundancy {
            Redundancy::Rep => 1,
            Redundancy::Ec { k, .. } => k,
        }
    }

    fn stream(&mut self, at: Location) -> Sid {
        self.stream_at.push(at);
        self.stream_at.len() - 1
    }

    fn source_stream(&mut self, i: usize) -> Sid {
        if let Some(sid) = self.materialized[i] {
            return sid;
        }
        let at = self.sources[i].location();
        let out = self.stream(at);
        let step = match &self.sources[i] {
            Source::Driver { .. } => {
                let slot = self.writes;
                self.writes += 1;
                Step::FromDriver { out, slot }
            }
            Source::Node {
                node, file_hash, ..
            } => Step::BlobRead {
                node: *node,
                hash: file_hash.clone(),
                out,
            },
        };
        self.steps.push((at, step));
        self.materialized[i] = Some(out);
        out
    }

    fn whole_source(&self, near: Location) -> Option<usize> {
        let whole: Vec<usize> = (0..self.sources.len())
            .filter(|i| self.sources[*i].index().is_none())
            .collect();
        whole
            .iter()
            .copied()
            .find(|i| self.sources[*i].location() == near)
            .or_else(|| whole.first().copied())
    }

    fn shard_source(&self, index: usize) -> Option<usize> {
        self.sources.iter().position(|s| s.index() == Some(index))
    }

    fn shard_source_count(&self) -> usize {
        self.sources.iter().filter(|s| s.index().is_some()).count()
    }

    fn route_shard(&self, index: usize) -> Option<ShardRoute> {
        if let Some(src) = self.shard_source(index) {
            return Some(ShardRoute::Source(src));
        }
        if self.whole_source(self.compute_at).is_some() {
            return Some(if index < self.k() {
                ShardRoute::Split(index)
            } else {
                ShardRoute::Derived(index)
            });
        }
        if self.shard_source_count() >= self.k() {
            return Some(ShardRoute::Derived(index));
        }
        None
    }

    /// First pass over a target: record which shards must be derived
    fn plan_target(&mut self, target: &Target) -> Result<()> {
        let routes = match target.index() {
            None if self.whole_source(target.location()).is_some() => return Ok(()),
            None if matches!(self.redundancy, Redundancy::Rep) => {
                return Err(SwitchError::NoSource("the whole object".into()));
            }
            None => (0..self.k())
                .map(|i| self.route_shard(i).ok_or_else(|| no_source(i)))
                .collect::<Result<Vec<_>>>()?,
            Some(i) => vec![self.route_shard(i).ok_or_else(|| no_source(i))?],
        };
        let decodes = routes.iter().any(|r| matches!(r, ShardRoute::Derived(_)));
        if target.index().is_none() && decodes {
            // the join takes every data shard from the decoder, surviving
            // ones included, so it never waits on a stream the decoder
            // also reads
            self.derived_wanted.extend(0..self.k());
        }
        for route in routes {
            match route {
                ShardRoute::Source(_) => {}
                ShardRoute::Split(_) => self.needs_split = true,
                ShardRoute::Derived(i) => {
                    self.derived_wanted.insert(i);
                }
            }
        }
        Ok(())
    }

    /// Create the split and the single erasure-coding step
    fn resolve_derived(&mut self) -> Result<()> {
        let k = self.k();
        let at = self.compute_at;

        if let Some(whole) = self.whole_source(at) {
            if !self.needs_split && self.derived_wanted.is_empty() {
                return Ok(());
            }
            let input = self.source_stream(whole);
            let outs: Vec<Sid> = (0..k).map(|_| self.stream(at)).collect();
            self.steps.push((
                at,
                Step::Split {
                    input,
                    outs: outs.clone(),
                },
            ));
            if !self.derived_wanted.is_empty() {
                let inputs: Vec<(Sid, usize)> = outs.iter().copied().zip(0..k).collect();
                self.push_compute(inputs);
            }
            self.split = Some(outs);
            return Ok(());
        }

        if self.derived_wanted.is_empty() {
            return Ok(());
        }
        let mut base: Vec<(usize, usize)> = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(src, s)| s.index().map(|i| (i, src)))
            .collect();
        base.sort_unstable();
        base.truncate(k);
        if base.len() < k {
            return Err(SwitchError::InsufficientShards {
                available: base.len(),
                required: k,
            });
        }
        let inputs: Vec<(Sid, usize)> = base
            .into_iter()
            .map(|(index, src)| (self.source_stream(src), index))
            .collect();
        self.push_compute(inputs);
        Ok(())
    }

    fn push_compute(&mut self, inputs: Vec<(Sid, usize)>) {
        let at = self.compute_at;
        let wanted: Vec<usize> = self.derived_wanted.iter().copied().collect();
        let outs: Vec<(Sid, usize)> = wanted.iter().map(|i| (self.stream(at), *i)).collect();
        for (sid, index) in &outs {
            self.derived.insert(*index, *sid);
        }
        self.steps.push((at, Step::Compute { inputs, outs }));
    }

    fn shard_stream(&mut self, index: usize) -> Result<Sid> {
        match self.route_shard(index).ok_or_else(|| no_source(index))? {
            ShardRoute::Source(src) => Ok(self.source_stream(src)),
            ShardRoute::Split(i) => self
                .split
                .as_ref()
                .map(|outs| outs[i])
                .ok_or_else(|| SwitchError::Internal("split was not planned".into())),
            ShardRoute::Derived(i) => self
                .derived
                .get(&i)
                .copied()
                .ok_or_else(|| SwitchError::Internal(format!("shard {} was not derived", i))),
        }
    }

    fn whole_stream(&mut self, near: Location) -> Result<Sid> {
        if let Some(src) = self.whole_source(near) {
            return Ok(self.source_stream(src));
        }
        if let Some(join) = self.join {
            return Ok(join);
        }
        let inputs = (0..self.k())
            .map(|i| match self.derived.get(&i).copied() {
                Some(sid) => Ok(sid),
                None => self.shard_stream(i),
            })
            .collect::<Result<Vec<_>>>()?;
        let out = self.stream(self.compute_at);
        self.steps.push((self.compute_at, Step::Join { inputs, out }));
        self.join = Some(out);
        Ok(out)
    }

    /// Second pass over a target: connect it to its stream
    fn wire_target(&mut self, target: &Target) -> Result<()> {
        let at = target.location();
        let input = match target.index() {
            None => self.whole_stream(at)?,
            Some(i) => self.shard_stream(i)?,
        };
        let step = match target {
            Target::Driver { .. } => {
                let slot = self.reads;
                self.reads += 1;
                Step::ToDriver { input, slot }
            }
            Target::Node {
                node, result_key, ..
            } => Step::ToBlob {
                node: *node,
                input,
                key: result_key.clone(),
            },
        };
        self.steps.push((at, step));
        Ok(())
    }

    fn emit(self, mut b: PlanBuilder, object_size: Option<u64>) -> ParsedPlan {
        let produced: Vec<VarId> = self.stream_at.iter().map(|_| b.new_var()).collect();

        let mut consumers: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.stream_at.len()];
        for (step_idx, (_, step)) in self.steps.iter().enumerate() {
            for (slot, sid) in step.inputs().into_iter().enumerate() {
                consumers[sid].push((step_idx, slot));
            }
        }

        let mut input_vars: HashMap<(usize, usize), VarId> = HashMap::new();
        for (sid, readers) in consumers.iter().enumerate() {
            let at = self.stream_at[sid];
            let var = produced[sid];
            match readers.as_slice() {
                [] => b.push(at, Op::Discard { input: var }),
                [(step_idx, slot)] => {
                    let to = self.steps[*step_idx].0;
                    input_vars.insert((*step_idx, *slot), b.transfer(var, at, to));
                }
                many => {
                    let outputs: Vec<VarId> = many.iter().map(|_| b.new_var()).collect();
                    b.push(
                        at,
                        Op::Clone {
                            input: var,
                            outputs: outputs.clone(),
                        },
                    );
                    for ((step_idx, slot), out) in many.iter().zip(outputs) {
                        let to = self.steps[*step_idx].0;
                        input_vars.insert((*step_idx, *slot), b.transfer(out, at, to));
                    }
                }
            }
        }

        let input = |step_idx: usize, slot: usize| input_vars[&(step_idx, slot)];
        let (k, n, chunk_size) = match self.redundancy {
            Redundancy::Rep => (1, 2, 0),
            Redundancy::Ec { k, n, chunk_size } => (k, n, chunk_size),
        };
        let mut writes: Vec<Option<WriteHandle>> = vec![None; self.writes];
        let mut reads: Vec<Option<ReadHandle>> = vec![None; self.reads];

        for (step_idx, (at, step)) in self.steps.into_iter().enumerate() {
            match step {
                Step::FromDriver { out, slot } => {
                    b.push(at, Op::FromDriver { output: produced[out] });
                    writes[slot] = Some(WriteHandle { var: produced[out] });
                }
                Step::BlobRead { hash, out, .. } => {
                    b.push(
                        at,
                        Op::BlobRead {
                            hash,
                            output: produced[out],
                        },
                    );
                }
                Step::Split { outs, .. } => b.push(
                    at,
                    Op::ChunkedSplit {
                        input: input(step_idx, 0),
                        outputs: outs.iter().map(|s| produced[*s]).collect(),
                        chunk_size,
                    },
                ),
                Step::Compute { inputs, outs } => {
                    let in_vars = (0..inputs.len()).map(|slot| input(step_idx, slot)).collect();
                    let in_indices = inputs.iter().map(|(_, i)| *i).collect();
                    let out_vars = outs.iter().map(|(s, _)| produced[*s]).collect();
                    let out_indices: Vec<usize> = outs.iter().map(|(_, i)| *i).collect();
                    let op = if out_indices.iter().copied().eq(0..k) {
                        Op::EcReconstruct {
                            k,
                            n,
                            chunk_size,
                            inputs: in_vars,
                            input_indices: in_indices,
                            outputs: out_vars,
                        }
                    } else {
                        Op::EcCompute {
                            k,
                            n,
                            chunk_size,
                            inputs: in_vars,
                            input_indices: in_indices,
                            outputs: out_vars,
                            output_indices: out_indices,
                        }
                    };
                    b.push(at, op);
                }
                Step::Join { inputs, out } => b.push(
                    at,
                    Op::ChunkedJoin {
                        inputs: (0..inputs.len()).map(|slot| input(step_idx, slot)).collect(),
                        output: produced[out],
                        chunk_size,
                        size: object_size,
                    },
                ),
                Step::ToDriver { slot, .. } => {
                    let var = input(step_idx, 0);
                    b.push(at, Op::ToDriver { input: var });
                    reads[slot] = Some(ReadHandle { var });
                }
                Step::ToBlob { key, .. } => {
                    let hash = b.new_var();
                    b.push(
                        at,
                        Op::BlobWrite {
                            input: input(step_idx, 0),
                            output: hash,
                        },
                    );
                    b.push(at, Op::Store { input: hash, key });
                }
            }
        }

        ParsedPlan {
            plan: b.build(),
            writes: writes.into_iter().flatten().collect(),
            reads: reads.into_iter().flatten().collect(),
        }
    }
}

fn no_source(index: usize) -> SwitchError {
    SwitchError::NoSource(format!("shard {}", index))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EC: Redundancy = Redundancy::Ec {
        k: 4,
        n: 6,
        chunk_size: 1024,
    };

    fn count(plan: &CompiledPlan, at: Location, kind: &str) -> usize {
        plan.plan_at(at)
            .map(|p| p.ops.iter().filter(|op| op.kind() == kind).count())
            .unwrap_or(0)
    }

    #[test]
    fn test_rep_upload_to_two_nodes() {
        let request = FromTo::new()
            .from(Source::driver())
            .to(Target::node(NodeId(1), "a"))
            .to(Target::node(NodeId(2), "b"));
        let parsed = Parser::new(Redundancy::Rep).parse(&request).unwrap();
        let plan = &parsed.plan;

        assert_eq!(parsed.writes.len(), 1);
        assert!(parsed.reads.is_empty());
        assert_eq!(count(plan, Location::Driver, "clone"), 1);
        assert_eq!(count(plan, Location::Driver, "send_stream"), 2);
        for node in [NodeId(1), NodeId(2)] {
            let at = Location::Node(node);
            assert_eq!(count(plan, at, "receive_stream"), 1);
            assert_eq!(count(plan, at, "blob_write"), 1);
            assert_eq!(count(plan, at, "store"), 1);
        }
        plan.driver.validate().unwrap();
    }

    #[test]
    fn test_ec_upload_one_shard_per_node() {
        let mut request = FromTo::new().from(Source::driver());
        for i in 0..6 {
            request = request.to(Target::node_shard(NodeId(i as u64), i, format!("block-{i}")));
        }
        let parsed = Parser::new(EC).parse(&request).unwrap();
        let plan = &parsed.plan;

        assert_eq!(count(plan, Location::Driver, "chunked_split"), 1);
        assert_eq!(count(plan, Location::Driver, "ec_compute"), 1);
        // data shards feed both the encoder and their node
        assert_eq!(count(plan, Location::Driver, "clone"), 4);
        assert_eq!(count(plan, Location::Driver, "send_stream"), 6);
        assert_eq!(plan.agents.len(), 6);
        for p in plan.agents.values() {
            p.validate().unwrap();
        }
    }

    #[test]
    fn test_download_prefers_data_shards() {
        let mut request = FromTo::new().to(Target::driver()).with_object_size(10_000);
        for i in 0..6 {
            request = request.from(Source::node_shard(NodeId(i as u64), format!("h{i}"), i));
        }
        let parsed = Parser::new(EC).parse(&request).unwrap();
        let plan = &parsed.plan;

        assert_eq!(parsed.reads.len(), 1);
        assert_eq!(count(plan, Location::Driver, "chunked_join"), 1);
        assert_eq!(count(plan, Location::Driver, "ec_compute"), 0);
        // parity shards are never read
        assert!(!plan.agents.contains_key(&NodeId(4)));
        assert!(!plan.agents.contains_key(&NodeId(5)));
    }

    #[test]
    fn test_download_with_lost_data_shards_reconstructs() {
        let request = FromTo::new()
            .from(Source::node_shard(NodeId(2), "h2", 2))
            .from(Source::node_shard(NodeId(3), "h3", 3))
            .from(Source::node_shard(NodeId(4), "h4", 4))
            .from(Source::node_shard(NodeId(5), "h5", 5))
            .to(Target::driver());
        let parsed = Parser::new(EC).parse(&request).unwrap();
        let plan = &parsed.plan;

        let decoded = plan
            .driver
            .ops
            .iter()
            .find_map(|op| match op {
                Op::EcReconstruct {
                    input_indices,
                    outputs,
                    ..
                } => Some((input_indices.clone(), outputs.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(decoded.0, vec![2, 3, 4, 5]);
        assert_eq!(count(plan, Location::Driver, "chunked_join"), 1);

        // surviving data shards reach the join through the decoder only
        assert_eq!(count(plan, Location::Driver, "clone"), 0);
        let join_inputs = plan
            .driver
            .ops
            .iter()
            .find_map(|op| match op {
                Op::ChunkedJoin { inputs, .. } => Some(inputs.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(join_inputs, decoded.1);
    }

    #[test]
    fn test_partial_loss_decodes_every_data_shard() {
        let request = FromTo::new()
            .from(Source::node_shard(NodeId(0), "h0", 0))
            .from(Source::node_shard(NodeId(2), "h2", 2))
            .from(Source::node_shard(NodeId(3), "h3", 3))
            .from(Source::node_shard(NodeId(5), "h5", 5))
            .to(Target::driver());
        let parsed = Parser::new(EC).parse(&request).unwrap();

        assert_eq!(count(&parsed.plan, Location::Driver, "ec_reconstruct"), 1);
        assert_eq!(count(&parsed.plan, Location::Driver, "ec_compute"), 0);
        assert_eq!(count(&parsed.plan, Location::Driver, "clone"), 0);
        parsed.plan.driver.validate().unwrap();
    }

    #[test]
    fn test_repair_computes_at_target() {
        let request = FromTo::new()
            .from(Source::node_shard(NodeId(0), "h0", 0))
            .from(Source::node_shard(NodeId(1), "h1", 1))
            .from(Source::node_shard(NodeId(2), "h2", 2))
            .from(Source::node_shard(NodeId(4), "h4", 4))
            .to(Target::node_shard(NodeId(9), 3, "block-3"));
        let parsed = Parser::new(EC).parse(&request).unwrap();
        let at = Location::Node(NodeId(9));

        assert_eq!(count(&parsed.plan, at, "ec_compute"), 1);
        assert_eq!(count(&parsed.plan, at, "receive_stream"), 4);
        assert_eq!(count(&parsed.plan, Location::Node(NodeId(0)), "send_stream"), 1);
        assert!(parsed.plan.driver.ops.is_empty());
    }

    #[test]
    fn test_unused_driver_source_is_discarded() {
        let request = FromTo::new()
            .from(Source::driver())
            .from(Source::driver_shard(1))
            .to(Target::driver());
        let err = Parser::new(Redundancy::Rep).parse(&request).unwrap_err();
        assert!(matches!(err, SwitchError::InvalidPlan(_)));

        let request = FromTo::new()
            .from(Source::driver_shard(0))
            .from(Source::driver())
            .to(Target::driver_shard(0));
        let parsed = Parser::new(EC).parse(&request).unwrap();
        assert_eq!(parsed.writes.len(), 2);
        assert_eq!(count(&parsed.plan, Location::Driver, "discard"), 1);
    }

    #[test]
    fn test_validation_failures() {
        let ok_source = Source::driver();
        let ok_target = Target::driver();
        let cases: Vec<(Redundancy, FromTo)> = vec![
            (Redundancy::Rep, FromTo::new().to(ok_target.clone())),
            (Redundancy::Rep, FromTo::new().from(ok_source.clone())),
            (
                Redundancy::Ec { k: 0, n: 2, chunk_size: 2 },
                FromTo::new().from(ok_source.clone()).to(ok_target.clone()),
            ),
            (
                Redundancy::Ec { k: 3, n: 3, chunk_size: 2 },
                FromTo::new().from(ok_source.clone()).to(ok_target.clone()),
            ),
            (
                Redundancy::Ec { k: 2, n: 300, chunk_size: 2 },
                FromTo::new().from(ok_source.clone()).to(ok_target.clone()),
            ),
            (
                Redundancy::Ec { k: 2, n: 3, chunk_size: 3 },
                FromTo::new().from(ok_source.clone()).to(ok_target.clone()),
            ),
            (
                EC,
                FromTo::new().from(ok_source.clone()).to(Target::driver_shard(6)),
            ),
            (
                EC,
                FromTo::new()
                    .from(Source::driver_shard(1))
                    .from(Source::node_shard(NodeId(1), "h", 1))
                    .to(ok_target.clone()),
            ),
        ];
        for (redundancy, request) in cases {
            let err = Parser::new(redundancy).parse(&request).unwrap_err();
            assert!(matches!(err, SwitchError::InvalidPlan(_)), "{:?}", request);
        }
    }

    #[test]
    fn test_no_source() {
        let request = FromTo::new()
            .from(Source::node_shard(NodeId(1), "h1", 1))
            .to(Target::driver_shard(2));
        assert!(matches!(
            Parser::new(EC).parse(&request),
            Err(SwitchError::NoSource(_))
        ));

        let request = FromTo::new()
            .from(Source::node_shard(NodeId(1), "h1", 1))
            .to(Target::driver());
        assert!(matches!(
            Parser::new(EC).parse(&request),
            Err(SwitchError::NoSource(_))
        ));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_any_k_shards_reach_the_driver(mask in 0u8..64) {
            let present: Vec<usize> = (0..6).filter(|i| mask & (1 << i) != 0).collect();
            let mut request = FromTo::new().to(Target::driver());
            for i in &present {
                request = request.from(Source::node_shard(NodeId(*i as u64), format!("h{i}"), *i));
            }
            let parser = Parser::new(Redundancy::Ec { k: 4, n: 6, chunk_size: 64 });

            match parser.parse(&request) {
                Ok(parsed) => {
                    prop_assert!(present.len() >= 4);
                    prop_assert_eq!(parsed.reads.len(), 1);
                    prop_assert!(parsed.plan.driver.validate().is_ok());
                    for plan in parsed.plan.agents.values() {
                        prop_assert!(plan.validate().is_ok());
                    }
                    // at most k blobs are read
                    let reads = parsed
                        .plan
                        .agents
                        .values()
                        .flat_map(|p| p.ops.iter())
                        .filter(|op| op.kind() == "blob_read")
                        .count();
                    prop_assert_eq!(reads, 4);
                }
                Err(SwitchError::InvalidPlan(_)) => prop_assert!(present.is_empty()),
                Err(e) => {
                    prop_assert!(present.len() < 4 && !present.is_empty(), "{:?}", e);
                    prop_assert!(matches!(e, SwitchError::NoSource(_)));
                }
            }
        }
    }
}

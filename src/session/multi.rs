//! Orchestration of one query over many shards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::FtgsParams;
use crate::error::{FtgsError, Result};
use crate::ftgs::codec::StreamFtgsIterator;
use crate::ftgs::distinct::calculate_distinct;
use crate::ftgs::interleaver::{SortedInterleaver, UnsortedInterleaver};
use crate::ftgs::iterator::{BoxedFtgsIterator, FtgsIterator};
use crate::ftgs::limit::{TermLimitedIterator, top_terms};
use crate::ftgs::merger::FtgsMerger;
use crate::ftgs::spill::persist;
use crate::ftgs::splitter::{FtgsSplitter, split};
use crate::ftgs::types::FieldSpec;
use crate::group::GroupStatsPool;
use crate::memory::{MemoryBudget, TempBudget};
use crate::regroup::{GroupMultiRemapRule, validate_rules};
use crate::remote::{CommandResponse, RemoteCommand, RemoteTransport, SplitRequest};
use crate::scheduler::YieldCheckpoint;
use crate::session::EngineContext;
use crate::session::local::{LocalSession, StatChange, TermSubset};
use crate::session::tasks::execute;
use crate::shard::Shard;

/// What each local session streams.
#[derive(Clone, Copy)]
enum StreamSource<'a> {
    Params(&'a FtgsParams),
    Subset(&'a TermSubset),
}

impl StreamSource<'_> {
    fn open<'s>(
        &self,
        session: &'s LocalSession,
        budget: &MemoryBudget,
        checkpoint: YieldCheckpoint,
    ) -> Result<Box<dyn FtgsIterator + 's>> {
        match self {
            StreamSource::Params(params) => session.ftgs_iterator(params, budget, checkpoint),
            StreamSource::Subset(subset) => {
                let iterator = session.subset_ftgs_iterator(subset, budget, checkpoint)?;
                Ok(Box::new(iterator))
            }
        }
    }
}

/// Splitters kept between split requests of the same query.
struct SplitterCache {
    request: SplitRequest,
    splitters: Vec<FtgsSplitter>,
}

impl SplitterCache {
    fn reusable(&self, request: &SplitRequest) -> bool {
        self.request.fields == request.fields
            && self.request.num_splits == request.num_splits
            && self.request.term_limit == request.term_limit
            && self.request.with_stats == request.with_stats
            && !self.splitters.first().is_none_or(FtgsSplitter::is_closed)
    }
}

/// A query session spanning the local shards of one node.
///
/// Every operation fans out to the per-shard [`LocalSession`]s on the
/// engine's worker pool, each task holding a CPU slot while it computes.
/// After [`MultiSession::close`] every operation fails with
/// [`FtgsError::IllegalState`].
pub struct MultiSession {
    id: String,
    context: Arc<EngineContext>,
    sessions: RwLock<Vec<LocalSession>>,
    budget: MemoryBudget,
    temp: TempBudget,
    splitters: Mutex<Option<SplitterCache>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MultiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSession")
            .field("id", &self.id)
            .field("shards", &self.sessions.read().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MultiSession {
    /// Open a session over `shards`. A random id is assigned when `id` is
    /// `None`.
    pub fn new(
        context: Arc<EngineContext>,
        id: Option<String>,
        shards: Vec<Arc<dyn Shard>>,
    ) -> Result<Self> {
        if shards.is_empty() {
            return Err(FtgsError::invalid_argument("a session needs at least one shard"));
        }
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let budget = MemoryBudget::new(context.config().memory_limit);
        let temp = TempBudget::new(context.config().temp_space_limit);
        let sessions = shards
            .into_iter()
            .map(|shard| LocalSession::open(shard, &budget))
            .collect::<Result<Vec<_>>>()?;
        info!("Opened session {id} over {} shards", sessions.len());

        Ok(MultiSession {
            id,
            context,
            sessions: RwLock::new(sessions),
            budget,
            temp,
            splitters: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn memory_budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn temp_budget(&self) -> &TempBudget {
        &self.temp
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FtgsError::illegal_state(format!("session {} is closed", self.id)));
        }
        Ok(())
    }

    fn yield_interval(&self) -> u64 {
        self.context.config().yield_interval
    }

    pub fn num_shards(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn num_stats(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.sessions.read().first().map_or(0, LocalSession::num_stats))
    }

    /// Largest group count over the shards.
    pub fn num_groups(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self
            .sessions
            .read()
            .iter()
            .map(LocalSession::num_groups)
            .max()
            .unwrap_or(0))
    }

    /// Push metric `name` on every shard. Every shard's table is rebuilt
    /// before any is swapped in, so a failure leaves all stacks unchanged.
    pub fn push_stat(&self, name: &str) -> Result<usize> {
        self.ensure_open()?;
        let mut sessions = self.sessions.write();
        let changes = sessions
            .iter()
            .map(|session| session.prepare_push_stat(name, &self.budget))
            .collect::<Result<Vec<_>>>()?;
        let depth = apply_stat_changes(&mut sessions, changes);
        debug!("Session {} pushed stat {name}", self.id);
        Ok(depth)
    }

    /// Pop the top stat on every shard, all or nothing like [`push_stat`](Self::push_stat).
    pub fn pop_stat(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut sessions = self.sessions.write();
        if sessions.first().is_none_or(|s| s.num_stats() == 0) {
            return Err(FtgsError::illegal_state("no stat to pop"));
        }
        let changes = sessions
            .iter()
            .map(|session| session.prepare_pop_stat(&self.budget))
            .collect::<Result<Vec<_>>>()?;
        Ok(apply_stat_changes(&mut sessions, changes))
    }

    /// Sum of stat `stat` per group over every shard, indexed by group id.
    pub fn group_stats(&self, stat: usize) -> Result<Vec<i64>> {
        self.ensure_open()?;
        let sessions = self.sessions.read();
        let num_groups = sessions.iter().map(LocalSession::num_groups).max().unwrap_or(0);
        let pool = GroupStatsPool::new(num_groups as usize);
        let scheduler = self.context.scheduler();

        execute(self.context.pool(), "group-stats", sessions.iter().collect::<Vec<_>>(), |_, session| {
            let _slot = scheduler.lock_slot();
            let mut buffer = pool.acquire();
            let result = session.add_group_stats(stat, &mut buffer);
            pool.release(buffer);
            result
        })?;
        debug!("Session {} summed stat {stat} over {} shards", self.id, pool.returned());
        Ok(pool.total())
    }

    /// Apply `rules` on every shard; returns the largest resulting group
    /// count.
    pub fn regroup(&self, rules: &[GroupMultiRemapRule], error_on_collision: bool) -> Result<u32> {
        self.ensure_open()?;
        validate_rules(rules)?;
        let mut sessions = self.sessions.write();
        let scheduler = self.context.scheduler();
        let interval = self.yield_interval();

        let counts = execute(self.context.pool(), "regroup", sessions.iter_mut().collect::<Vec<_>>(), |_, session| {
            let slot = scheduler.lock_slot();
            let mut checkpoint = slot.checkpoint(interval);
            session.regroup(rules, error_on_collision, &self.budget, &mut checkpoint)
        })?;
        let num_groups = counts.into_iter().max().unwrap_or(0);
        info!("Session {} regrouped with {} rules: {num_groups} groups", self.id, rules.len());
        Ok(num_groups)
    }

    /// Salted probabilistic split of `target_group` on metric `metric`.
    pub fn random_metric_regroup(
        &self,
        metric: &str,
        salt: &str,
        p: f64,
        target_group: u32,
        negative_group: u32,
        positive_group: u32,
    ) -> Result<u32> {
        self.ensure_open()?;
        let mut sessions = self.sessions.write();
        let scheduler = self.context.scheduler();
        let interval = self.yield_interval();

        let counts = execute(
            self.context.pool(),
            "random-regroup",
            sessions.iter_mut().collect::<Vec<_>>(),
            |_, session| {
                let slot = scheduler.lock_slot();
                let mut checkpoint = slot.checkpoint(interval);
                session.random_metric_regroup(
                    metric,
                    salt,
                    p,
                    target_group,
                    negative_group,
                    positive_group,
                    &self.budget,
                    &mut checkpoint,
                )
            },
        )?;
        Ok(counts.into_iter().max().unwrap_or(0))
    }

    /// FTGS stream over every shard, shaped by `params`.
    pub fn ftgs_iterator(&self, params: &FtgsParams) -> Result<BoxedFtgsIterator> {
        self.ensure_open()?;
        let sessions = self.sessions.read();
        if let [session] = sessions.as_slice() {
            return self.persist_single(session, StreamSource::Params(params));
        }

        let partial = params.partial();
        let merged = self.merge_sessions(
            &sessions,
            StreamSource::Params(&partial),
            params.sorted && !params.is_top_terms(),
        )?;
        self.shape(merged, params.term_limit, params.sort_stat)
    }

    /// Sorted FTGS stream over the listed terms only.
    pub fn subset_ftgs_iterator(&self, subset: &TermSubset) -> Result<BoxedFtgsIterator> {
        self.ensure_open()?;
        let sessions = self.sessions.read();
        if let [session] = sessions.as_slice() {
            return self.persist_single(session, StreamSource::Subset(subset));
        }
        self.merge_sessions(&sessions, StreamSource::Subset(subset), true)
    }

    /// Per-group distinct term counts of one field.
    pub fn distinct(&self, field: &str, is_int: bool) -> Result<Vec<i64>> {
        self.ensure_open()?;
        let params = distinct_params(field, is_int);
        {
            let sessions = self.sessions.read();
            if let [session] = sessions.as_slice() {
                let slot = self.context.scheduler().lock_slot();
                let mut iterator =
                    session.ftgs_iterator(&params, &self.budget, slot.checkpoint(self.yield_interval()))?;
                return calculate_distinct(&mut iterator);
            }
        }
        let mut iterator = self.ftgs_iterator(&params)?;
        calculate_distinct(&mut iterator)
    }

    /// Serve bucket `split_index` of this node's stream to a merging node.
    ///
    /// The first request splits every shard's stream into
    /// `request.num_splits` buckets; later requests for other buckets of the
    /// same stream reuse those splitters until all buckets have been
    /// consumed.
    pub fn ftgs_iterator_split(&self, request: &SplitRequest) -> Result<BoxedFtgsIterator> {
        self.ensure_open()?;
        check_split(request.split_index, request.num_splits)?;
        let sessions = self.sessions.read();
        let mut cache = self.splitters.lock();

        if !cache.as_ref().is_some_and(|c| c.reusable(request)) {
            // dropping the old splitters closes their remaining buckets
            *cache = None;
            let params = FtgsParams {
                fields: request.fields.clone(),
                term_limit: request.term_limit,
                sort_stat: None,
                sorted: true,
                with_stats: request.with_stats,
            };
            let scheduler = self.context.scheduler();
            let interval = self.yield_interval();
            let splitters = execute(self.context.pool(), "splitter", sessions.iter().collect::<Vec<_>>(), |_, session| {
                let slot = scheduler.lock_slot();
                let mut iterator = session.ftgs_iterator(&params, &self.budget, slot.checkpoint(interval))?;
                FtgsSplitter::new(&mut iterator, request.num_splits, &self.temp)
            })?;
            debug!(
                "Session {} split {} shards into {} buckets",
                self.id,
                splitters.len(),
                request.num_splits
            );
            *cache = Some(SplitterCache {
                request: request.clone(),
                splitters,
            });
        }

        let Some(entry) = cache.as_mut() else {
            return Err(FtgsError::illegal_state("splitter cache missing"));
        };
        let mut buckets = entry
            .splitters
            .iter_mut()
            .map(|splitter| splitter.take(request.split_index))
            .collect::<Result<Vec<_>>>()?;
        if buckets.len() == 1 {
            return buckets
                .pop()
                .ok_or_else(|| FtgsError::illegal_state("no split bucket"));
        }
        let merged: BoxedFtgsIterator = Box::new(FtgsMerger::new(buckets)?);
        Ok(limit_terms(merged, request.term_limit))
    }

    /// Merge bucket `split_index` of the streams of every node in `nodes`.
    ///
    /// Each node is asked for the same bucket; top-terms requests fetch
    /// unlimited buckets since ranking needs every term.
    pub fn merge_ftgs_split(
        &self,
        params: &FtgsParams,
        nodes: &[String],
        split_index: usize,
        transport: &dyn RemoteTransport,
    ) -> Result<BoxedFtgsIterator> {
        self.ensure_open()?;
        check_split(split_index, nodes.len())?;
        let request = SplitRequest {
            fields: params.fields.clone(),
            split_index,
            num_splits: nodes.len(),
            term_limit: if params.is_top_terms() { 0 } else { params.term_limit },
            with_stats: params.with_stats,
        };

        let streams = execute(self.context.pool(), "fetch", nodes.iter().collect::<Vec<_>>(), |_, node| {
            let reader = transport.fetch_split(node, &self.id, &request)?;
            Ok(Box::new(StreamFtgsIterator::new(reader)?) as BoxedFtgsIterator)
        })?;
        debug!("Session {} fetched split {split_index} from {} nodes", self.id, nodes.len());

        let merged = self.merge_streams(streams, params.sorted && !params.is_top_terms())?;
        self.shape(merged, params.term_limit, params.sort_stat)
    }

    /// Distinct counts over bucket `split_index` of every node's stream.
    pub fn merge_distinct_split(
        &self,
        field: &str,
        is_int: bool,
        nodes: &[String],
        split_index: usize,
        transport: &dyn RemoteTransport,
    ) -> Result<Vec<i64>> {
        let params = distinct_params(field, is_int);
        let mut iterator = self.merge_ftgs_split(&params, nodes, split_index, transport)?;
        calculate_distinct(&mut iterator)
    }

    /// Run a fanned-out session command on this node.
    pub fn execute_command(&self, command: &RemoteCommand) -> Result<CommandResponse> {
        command.apply(self)
    }

    /// Release every shard session and cached splitter. Safe to call more
    /// than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.splitters.lock().take();
        let sessions = std::mem::take(&mut *self.sessions.write());
        drop(sessions);

        let used = self.budget.used();
        if used > 0 {
            error!("Session {} leaked {used} bytes of its memory budget", self.id);
        }
        info!("Closed session {}", self.id);
    }

    fn persist_single(&self, session: &LocalSession, source: StreamSource<'_>) -> Result<BoxedFtgsIterator> {
        let slot = self.context.scheduler().lock_slot();
        let mut iterator = source.open(session, &self.budget, slot.checkpoint(self.yield_interval()))?;
        Ok(Box::new(persist(&mut iterator, &self.temp)?))
    }

    /// Split every shard's stream on the pool, then merge bucket by bucket.
    fn merge_sessions(
        &self,
        sessions: &[LocalSession],
        source: StreamSource<'_>,
        sorted: bool,
    ) -> Result<BoxedFtgsIterator> {
        let num_splits = self.context.config().merge_splits();
        let scheduler = self.context.scheduler();
        let interval = self.yield_interval();
        let split_streams = execute(self.context.pool(), "split", sessions.iter().collect::<Vec<_>>(), |_, session| {
            let slot = scheduler.lock_slot();
            let mut iterator = source.open(session, &self.budget, slot.checkpoint(interval))?;
            split(&mut iterator, num_splits, &self.temp)
        })?;
        self.merge_buckets(split_streams, sorted)
    }

    /// Split already materialized streams, then merge bucket by bucket.
    fn merge_streams(&self, streams: Vec<BoxedFtgsIterator>, sorted: bool) -> Result<BoxedFtgsIterator> {
        let num_splits = self.context.config().merge_splits();
        let split_streams = execute(self.context.pool(), "split", streams, |_, mut stream| {
            split(&mut stream, num_splits, &self.temp)
        })?;
        self.merge_buckets(split_streams, sorted)
    }

    /// Merge bucket `j` of every source on its own task, persist each
    /// merged bucket and interleave them.
    fn merge_buckets(&self, per_source: Vec<Vec<BoxedFtgsIterator>>, sorted: bool) -> Result<BoxedFtgsIterator> {
        let num_splits = per_source.first().map_or(0, Vec::len);
        let mut buckets: Vec<Vec<BoxedFtgsIterator>> =
            (0..num_splits).map(|_| Vec::with_capacity(per_source.len())).collect();
        for splits in per_source {
            for (bucket, iterator) in buckets.iter_mut().zip(splits) {
                bucket.push(iterator);
            }
        }

        let scheduler = self.context.scheduler();
        let merged = execute(self.context.pool(), "merge", buckets, |_, bucket| {
            let _slot = scheduler.lock_slot();
            let mut merger = FtgsMerger::new(bucket)?;
            Ok(Box::new(persist(&mut merger, &self.temp)?) as BoxedFtgsIterator)
        })?;
        debug!("Session {} merged {num_splits} buckets", self.id);

        if sorted {
            Ok(Box::new(SortedInterleaver::new(merged)?))
        } else {
            Ok(Box::new(UnsortedInterleaver::new(merged)?))
        }
    }

    /// Apply the request's final term selection to a combined stream.
    fn shape(
        &self,
        mut iterator: BoxedFtgsIterator,
        term_limit: usize,
        sort_stat: Option<usize>,
    ) -> Result<BoxedFtgsIterator> {
        match sort_stat {
            Some(stat) if term_limit > 0 => {
                let _slot = self.context.scheduler().lock_slot();
                Ok(Box::new(top_terms(&mut iterator, term_limit, stat)?))
            }
            _ => Ok(limit_terms(iterator, term_limit)),
        }
    }
}

impl Drop for MultiSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn limit_terms(iterator: BoxedFtgsIterator, term_limit: usize) -> BoxedFtgsIterator {
    if term_limit > 0 {
        Box::new(TermLimitedIterator::new(iterator, term_limit))
    } else {
        iterator
    }
}

fn distinct_params(field: &str, is_int: bool) -> FtgsParams {
    let spec = if is_int {
        FieldSpec::int(field)
    } else {
        FieldSpec::string(field)
    };
    FtgsParams::new(vec![spec]).with_sorted(false).without_stats()
}

fn apply_stat_changes(sessions: &mut [LocalSession], changes: Vec<StatChange>) -> usize {
    sessions
        .iter_mut()
        .zip(changes)
        .map(|(session, change)| session.apply_stat_change(change))
        .min()
        .unwrap_or(0)
}

fn check_split(split_index: usize, num_splits: usize) -> Result<()> {
    if num_splits == 0 {
        return Err(FtgsError::invalid_argument("no nodes to split over"));
    }
    if split_index >= num_splits {
        return Err(FtgsError::invalid_argument(format!(
            "split index {split_index} out of range for {num_splits} splits"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ftgs::drain;
    use crate::ftgs::types::Term;
    use crate::regroup::RegroupCondition;
    use crate::shard::MemoryShard;

    fn context() -> Arc<EngineContext> {
        EngineContext::new(
            EngineConfig::default()
                .with_worker_threads(4)
                .with_cpu_slots(2)
                .with_merge_splits(3),
        )
        .unwrap()
    }

    fn shard(name: &str, values: Vec<i64>, colors: &[&str]) -> Arc<dyn Shard> {
        let n = values.len() as u32;
        Arc::new(
            MemoryShard::builder(name, n)
                .int_column("x", values)
                .string_column("c", colors.iter().copied())
                .build()
                .unwrap(),
        )
    }

    fn session() -> MultiSession {
        MultiSession::new(
            context(),
            Some("q1".to_string()),
            vec![
                shard("a", vec![1, 2, 3], &["red", "blue", "red"]),
                shard("b", vec![3, 4], &["blue", "green"]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_ftgs_sums_across_shards() {
        let s = session();
        s.push_stat("count()").unwrap();
        let mut it = s.ftgs_iterator(&FtgsParams::new(vec![FieldSpec::string("c")])).unwrap();
        assert!(it.is_sorted());
        let records = drain(&mut it).unwrap();
        let counts: Vec<(Term, i64)> = records
            .iter()
            .map(|r| (r.term.clone(), r.groups.get(1).unwrap()[0]))
            .collect();
        assert_eq!(
            counts,
            vec![(Term::str("blue"), 2), (Term::str("green"), 1), (Term::str("red"), 2)]
        );
    }

    #[test]
    fn test_group_stats_and_regroup() {
        let s = session();
        s.push_stat("x").unwrap();
        let rule = GroupMultiRemapRule::new(1, 1).when(RegroupCondition::string_eq("c", "red"), 2);
        assert_eq!(s.regroup(&[rule], false).unwrap(), 3);
        assert_eq!(s.num_groups().unwrap(), 3);
        assert_eq!(s.group_stats(0).unwrap(), vec![0, 2 + 3 + 4, 1 + 3]);
    }

    #[test]
    fn test_failed_push_leaves_stacks_equal() {
        let s = MultiSession::new(
            context(),
            None,
            vec![
                Arc::new(
                    MemoryShard::builder("b", 1)
                        .int_column("x", vec![1])
                        .metric("only_b", vec![5])
                        .build()
                        .unwrap(),
                ),
                shard("a", vec![1], &["x"]),
            ],
        )
        .unwrap();
        assert!(s.push_stat("only_b").is_err());
        assert_eq!(s.num_stats().unwrap(), 0);
        assert_eq!(stat_depths(&s), vec![0, 0]);
        assert!(s.pop_stat().is_err());
    }

    fn stat_depths(s: &MultiSession) -> Vec<usize> {
        s.sessions.read().iter().map(LocalSession::num_stats).collect()
    }

    #[test]
    fn test_stat_stack_unchanged_under_memory_pressure() {
        let s = MultiSession::new(
            context(),
            None,
            vec![
                shard("small", (0..10).collect(), &["red"; 10]),
                shard("large", (0..10_000).collect(), &["blue"; 10_000]),
            ],
        )
        .unwrap();
        s.push_stat("x").unwrap();
        let used = s.memory_budget().used();

        let hog = s.memory_budget().claim(s.memory_budget().available() - 100).unwrap();
        let err = s.pop_stat().unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(stat_depths(&s), vec![1, 1]);
        let err = s.push_stat("count()").unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(stat_depths(&s), vec![1, 1]);
        drop(hog);
        assert_eq!(s.memory_budget().used(), used);

        assert_eq!(s.pop_stat().unwrap(), 0);
        assert_eq!(stat_depths(&s), vec![0, 0]);
    }

    #[test]
    fn test_top_terms_and_distinct() {
        let s = session();
        s.push_stat("x").unwrap();
        let params = FtgsParams::new(vec![FieldSpec::int("x")]).with_top_terms(2, 0);
        let mut it = s.ftgs_iterator(&params).unwrap();
        let terms: Vec<Term> = drain(&mut it).unwrap().into_iter().map(|r| r.term).collect();
        assert_eq!(terms, vec![Term::Int(3), Term::Int(4)]);

        assert_eq!(s.distinct("c", false).unwrap(), vec![0, 3]);
        assert_eq!(s.distinct("x", true).unwrap(), vec![0, 4]);
    }

    #[test]
    fn test_split_serving() {
        let s = session();
        s.push_stat("count()").unwrap();
        let request = SplitRequest {
            fields: vec![FieldSpec::string("c")],
            split_index: 0,
            num_splits: 2,
            term_limit: 0,
            with_stats: true,
        };
        let mut terms = Vec::new();
        for index in 0..2 {
            let request = SplitRequest {
                split_index: index,
                ..request.clone()
            };
            let mut it = s.ftgs_iterator_split(&request).unwrap();
            terms.extend(drain(&mut it).unwrap().into_iter().map(|r| r.term));
        }
        terms.sort();
        assert_eq!(terms, vec![Term::str("blue"), Term::str("green"), Term::str("red")]);

        let bad = SplitRequest {
            split_index: 2,
            ..request
        };
        assert!(matches!(s.ftgs_iterator_split(&bad), Err(FtgsError::InvalidArgument(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let s = session();
        s.push_stat("x").unwrap();
        assert!(s.memory_budget().used() > 0);
        s.close();
        s.close();
        assert!(s.is_closed());
        assert_eq!(s.memory_budget().used(), 0);
        assert!(matches!(s.num_groups(), Err(FtgsError::IllegalState(_))));
        assert!(s.ftgs_iterator(&FtgsParams::new(vec![FieldSpec::int("x")])).is_err());
    }

    #[test]
    fn test_empty_session_rejected() {
        assert!(MultiSession::new(context(), None, Vec::new()).is_err());
    }
}

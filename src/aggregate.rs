//! One-round collective reduction over a shared result table.
//!
//! Every member writes its local values into its own row, publishes the row,
//! waits until every member's row is visible and then folds each column
//! locally. Because nobody reads before everybody has published, and every
//! member folds the same rows in the same order, all members that complete a
//! round return bit-identical results.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, field, trace, warn, Instrument, Span};
use typed_builder::TypedBuilder;

use crate::{
    error::{ConfigurationError, Error},
    group::MemberList,
    reduce::{fold, Column, ReduceOp, Reducer},
    table::{wire::AbortReason, ResultTable, TableProvider},
};

/// Per-round failure policy.
#[derive(Clone, Debug, TypedBuilder)]
pub struct RoundOptions {
    /// Upper bound on waiting for the other members. `None` waits forever.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
    /// Abandons the round locally when cancelled before synchronization
    /// completes.
    #[builder(default, setter(strip_option))]
    pub cancel: Option<CancellationToken>,
    /// Send an abort notice to the other members when giving up, so they fail
    /// fast instead of waiting on a row that will never come.
    #[builder(default = true)]
    pub notify_peers: bool,
}

impl Default for RoundOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Where a round is. Each step of the round moves it forward by exactly one
/// state; a failed step leaves it `Abandoned` for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundState {
    Created,
    ValuesWritten,
    Published,
    Synchronized,
    Reduced,
    Abandoned,
}

/// Drives one table through a round. [`Aggregator`] is the usual way to run
/// one; this is exposed for callers that want to own the table.
pub struct Round<T> {
    table: T,
    state: RoundState,
}

enum Wait {
    Done(Result<(), Error>),
    TimedOut(Duration),
    Cancelled,
}

impl<T: ResultTable> Round<T> {
    pub fn new(table: T) -> Self {
        Self {
            table,
            state: RoundState::Created,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    fn enter(
        &mut self,
        step: &'static str,
        from: RoundState,
    ) -> Result<(), Error> {
        if self.state != from {
            Err(ConfigurationError::OutOfOrder {
                step,
                state: self.state,
            })?
        }
        Ok(())
    }

    fn advance(&mut self, to: RoundState) {
        trace!("round {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    fn abandon<V>(&mut self, error: Error) -> Result<V, Error> {
        debug!("round abandoned while {:?}: {}", self.state, error);
        self.state = RoundState::Abandoned;
        Err(error)
    }

    /// Writes this member's values, one per column.
    pub fn write(&mut self, values: &[f64]) -> Result<(), Error> {
        self.enter("write", RoundState::Created)?;
        if values.len() != self.table.column_count() {
            return self.abandon(
                ConfigurationError::ReducerCount {
                    expected: self.table.column_count(),
                    got: values.len(),
                }
                .into(),
            );
        }
        for (column, value) in values.iter().enumerate() {
            if let Err(e) = self.table.write_local(column, *value) {
                return self.abandon(e);
            }
        }
        self.advance(RoundState::ValuesWritten);
        Ok(())
    }

    pub async fn publish(&mut self, options: &RoundOptions) -> Result<(), Error> {
        self.enter("publish", RoundState::ValuesWritten)?;
        if let Err(e) = self.table.publish().await {
            if options.notify_peers {
                self.table.abort(AbortReason::PublishFailed).await;
            }
            return self.abandon(e);
        }
        self.advance(RoundState::Published);
        Ok(())
    }

    /// Waits for every member's row, within the options' timeout and until
    /// the options' token is cancelled.
    pub async fn synchronize(
        &mut self,
        options: &RoundOptions,
    ) -> Result<(), Error> {
        self.enter("synchronize", RoundState::Published)?;
        match Self::wait(&mut self.table, options).await {
            Wait::Done(Ok(())) => {
                self.advance(RoundState::Synchronized);
                Ok(())
            }
            Wait::Done(Err(e)) => self.abandon(e),
            Wait::TimedOut(timeout) => {
                let waiting_on = self.table.unpublished_members();
                warn!(
                    "Gave up after {:?} waiting on members {:?}",
                    timeout, waiting_on
                );
                if options.notify_peers {
                    self.table.abort(AbortReason::TimedOut).await;
                }
                self.abandon(Error::SynchronizationTimeout {
                    timeout,
                    waiting_on,
                })
            }
            Wait::Cancelled => {
                if options.notify_peers {
                    self.table.abort(AbortReason::Cancelled).await;
                }
                self.abandon(Error::RoundAborted)
            }
        }
    }

    async fn wait(table: &mut T, options: &RoundOptions) -> Wait {
        let cancel = options.cancel.clone().unwrap_or_default();
        let sync = async {
            match options.timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, table.synchronize()).await
                    {
                        Ok(done) => Wait::Done(done),
                        Err(_) => Wait::TimedOut(limit),
                    }
                }
                None => Wait::Done(table.synchronize().await),
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Wait::Cancelled,
            wait = sync => wait,
        }
    }

    /// Folds every column over all rows in member order.
    pub fn fold(
        &mut self,
        reducers: &[&(dyn Reducer + Sync)],
    ) -> Result<Vec<f64>, Error> {
        self.enter("fold", RoundState::Synchronized)?;
        let columns = self.table.column_count();
        if reducers.len() != columns {
            return self.abandon(
                ConfigurationError::ReducerCount {
                    expected: columns,
                    got: reducers.len(),
                }
                .into(),
            );
        }
        let members = self.table.members().len();
        let mut reduced = Vec::with_capacity(columns);
        for (column, reducer) in reducers.iter().enumerate() {
            let values = match (0..members)
                .map(|member| self.table.read(member, column))
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(values) => values,
                Err(e) => return self.abandon(e),
            };
            let value = match fold(*reducer, values) {
                Some(value) => value,
                None => {
                    return self
                        .abandon(ConfigurationError::EmptyMemberList.into())
                }
            };
            reduced.push(value);
        }
        self.advance(RoundState::Reduced);
        Ok(reduced)
    }
}

/// Runs reduction rounds for one member. Each call builds a fresh table from
/// the provider and drops it when the round ends.
pub struct Aggregator<P> {
    provider: P,
}

impl<P: TableProvider> Aggregator<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Reduces every column with the same reducer.
    pub async fn reduce<R>(
        &self,
        members: &MemberList,
        local_index: usize,
        values: &[f64],
        reducer: &R,
        options: &RoundOptions,
    ) -> Result<Vec<f64>, Error>
    where
        R: Reducer + Sync,
    {
        let reducer: &(dyn Reducer + Sync) = reducer;
        let reducers = vec![reducer; values.len()];
        self.run(members, local_index, values, &reducers, options).await
    }

    /// Reduces each column with the column's own operation.
    pub async fn reduce_columns(
        &self,
        members: &MemberList,
        local_index: usize,
        columns: &[Column],
        options: &RoundOptions,
    ) -> Result<Vec<f64>, Error> {
        let values: Vec<f64> = columns.iter().map(|c| c.value).collect();
        let reducers: Vec<&(dyn Reducer + Sync)> = columns
            .iter()
            .map(|c| &c.op as &(dyn Reducer + Sync))
            .collect();
        self.run(members, local_index, &values, &reducers, options).await
    }

    /// Cluster-wide total of one additive value, such as a throughput.
    pub async fn reduce_sum(
        &self,
        members: &MemberList,
        local_index: usize,
        value: f64,
        options: &RoundOptions,
    ) -> Result<f64, Error> {
        let reduced = self
            .reduce(members, local_index, &[value], &ReduceOp::Sum, options)
            .await?;
        Ok(reduced[0])
    }

    /// Cluster-wide mean, computed from a sum column and a count column.
    pub async fn reduce_mean(
        &self,
        members: &MemberList,
        local_index: usize,
        value: f64,
        options: &RoundOptions,
    ) -> Result<f64, Error> {
        let columns = [Column::sum(value), Column::count()];
        let reduced = self
            .reduce_columns(members, local_index, &columns, options)
            .await?;
        Ok(reduced[0] / reduced[1])
    }

    async fn run(
        &self,
        members: &MemberList,
        local_index: usize,
        values: &[f64],
        reducers: &[&(dyn Reducer + Sync)],
        options: &RoundOptions,
    ) -> Result<Vec<f64>, Error> {
        members.check_index(local_index)?;
        if values.is_empty() {
            Err(ConfigurationError::NoColumns)?
        }
        let span = debug_span!(
            "round",
            group = %members.digest(),
            round = field::Empty,
            members = members.len(),
            local_index,
            columns = values.len()
        );
        async move {
            let table = self
                .provider
                .construct(members, local_index, values.len())
                .await?;
            Span::current().record("round", table.round());
            let mut round = Round::new(table);
            round.write(values)?;
            round.publish(options).await?;
            round.synchronize(options).await?;
            let reduced = round.fold(reducers)?;
            debug!("reduced to {:?}", reduced);
            Ok(reduced)
        }
        .instrument(span)
        .await
    }
}

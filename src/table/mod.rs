//! The shared result table: one row per member, each row written only by its
//! owner and replicated to every other member.
//!
//! A table lives for exactly one round. [`TableProvider::construct`] hands out
//! a fresh one, the aggregator drives it through write, publish, synchronize
//! and read, and drops it. Transports only need to move [`wire::Frame`]s
//! between members through a [`Link`]; [`ReplicaTable`] does the rest.

use async_trait::async_trait;

use crate::{
    error::Error,
    group::{MemberId, MemberList},
};

mod inbox;
pub mod memory;
mod replica;
#[cfg(feature = "tcp")]
pub mod tcp;
pub mod wire;

pub use replica::ReplicaTable;
use wire::{AbortReason, Frame};

#[async_trait]
pub trait ResultTable: Send {
    fn members(&self) -> &MemberList;

    /// Transport-assigned number of the round this table belongs to.
    fn round(&self) -> u64;

    /// Row owned by this member.
    fn local_index(&self) -> usize;

    fn column_count(&self) -> usize;

    /// Stores `value` in this member's own row.
    fn write_local(&mut self, column: usize, value: f64) -> Result<(), Error>;

    /// Makes every local write since the last publish visible to the other
    /// members. Does not wait for them to observe it.
    async fn publish(&mut self) -> Result<(), Error>;

    /// Waits until a publish from every member, this one included, has been
    /// observed for this round. Fails if a member is known to have abandoned
    /// the round by then, even after publishing.
    async fn synchronize(&mut self) -> Result<(), Error>;

    /// Currently visible value of a cell. Only meaningful once
    /// [`ResultTable::synchronize`] has returned.
    fn read(&self, member_index: usize, column: usize) -> Result<f64, Error>;

    /// Row indices that have not been observed as published yet.
    fn unpublished(&self) -> Vec<usize>;

    /// Tells the other members, best effort, that this member is abandoning
    /// the round.
    async fn abort(&mut self, reason: AbortReason);

    /// Ids of the members whose rows are still missing.
    fn unpublished_members(&self) -> Vec<MemberId> {
        self.unpublished()
            .into_iter()
            .map(|index| self.members()[index])
            .collect()
    }
}

/// Builds a fresh table for each round.
#[async_trait]
pub trait TableProvider: Send + Sync {
    type Table: ResultTable;

    /// Allocates one row per member, `column_count` wide.
    async fn construct(
        &self,
        members: &MemberList,
        local_index: usize,
        column_count: usize,
    ) -> Result<Self::Table, Error>;
}

/// Moves frames between the replicas of one round's table.
#[async_trait]
pub trait Link: Send {
    /// Round this link carries frames for.
    fn round(&self) -> u64;

    /// Sends `frame` to every other member of the round.
    async fn broadcast(&mut self, frame: Frame) -> Result<(), Error>;

    /// Next frame addressed to this round, or `None` once the transport is
    /// closed.
    async fn recv(&mut self) -> Option<Frame>;

    /// Next frame for this round that has already arrived, if any.
    fn try_recv(&mut self) -> Option<Frame>;
}

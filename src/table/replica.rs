use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, trace, warn};

use super::{
    wire::{AbortReason, Frame, FrameBody},
    Link, ResultTable,
};
use crate::{
    error::{ConfigurationError, Error},
    group::MemberList,
};

struct Row {
    values: Vec<f64>,
    /// Highest publish generation observed, 0 if never published.
    generation: u64,
}

/// A member's replica of the round's table. Local writes land in the owned
/// row and are sent to the other replicas on publish; frames from the other
/// members are applied while synchronizing.
pub struct ReplicaTable<L> {
    members: MemberList,
    local_index: usize,
    column_count: usize,
    rows: Vec<Row>,
    link: L,
}

impl<L: Link> ReplicaTable<L> {
    pub fn new(
        members: MemberList,
        local_index: usize,
        column_count: usize,
        link: L,
    ) -> Result<Self, ConfigurationError> {
        members.check_index(local_index)?;
        if column_count == 0 {
            Err(ConfigurationError::NoColumns)?
        }
        let rows = (0..members.len())
            .map(|_| Row {
                values: vec![0.0; column_count],
                generation: 0,
            })
            .collect();
        Ok(Self {
            members,
            local_index,
            column_count,
            rows,
            link,
        })
    }

    fn all_published(&self) -> bool {
        self.rows.iter().all(|row| row.generation > 0)
    }

    fn apply(&mut self, frame: Frame) -> Result<(), Error> {
        let member = frame.from;
        if frame.digest != self.members.digest() {
            Err(Error::MembershipMismatch { member })?
        }
        let from = match self.members.index_of(member) {
            Some(index) if index != self.local_index => index,
            _ => {
                warn!("Ignoring frame from member {} for another row", member);
                return Ok(());
            }
        };

        match frame.body {
            FrameBody::Row { generation, values } => {
                if values.len() != self.column_count {
                    Err(Error::ColumnMismatch {
                        member,
                        expected: self.column_count,
                        got: values.len(),
                    })?
                }
                let row = &mut self.rows[from];
                if generation <= row.generation {
                    trace!(
                        "dropping stale generation {} from member {}",
                        generation,
                        member
                    );
                    return Ok(());
                }
                trace!(
                    "observed row of member {} generation {} after {}µs",
                    member,
                    generation,
                    Utc::now().timestamp_micros() - frame.sent_at
                );
                row.values = values;
                row.generation = generation;
                Ok(())
            }
            FrameBody::Abort(AbortReason::PublishFailed) => {
                Err(Error::PublishFailure {
                    member,
                    reason: "peer reported a failed publish".into(),
                })
            }
            FrameBody::Abort(reason) => {
                Err(Error::PeerAborted { member, reason })
            }
        }
    }
}

#[async_trait]
impl<L: Link> ResultTable for ReplicaTable<L> {
    fn members(&self) -> &MemberList {
        &self.members
    }

    fn round(&self) -> u64 {
        self.link.round()
    }

    fn local_index(&self) -> usize {
        self.local_index
    }

    fn column_count(&self) -> usize {
        self.column_count
    }

    fn write_local(&mut self, column: usize, value: f64) -> Result<(), Error> {
        match self.rows[self.local_index].values.get_mut(column) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(ConfigurationError::ColumnOutOfRange {
                column,
                columns: self.column_count,
            }
            .into()),
        }
    }

    async fn publish(&mut self) -> Result<(), Error> {
        let row = &mut self.rows[self.local_index];
        row.generation += 1;
        let frame = Frame::row(
            self.link.round(),
            self.members.digest(),
            self.members[self.local_index],
            row.generation,
            row.values.clone(),
        );
        let generation = row.generation;
        if let Err(e) = self.link.broadcast(frame).await {
            // a row the others never saw was never published
            self.rows[self.local_index].generation -= 1;
            Err(Error::PublishFailure {
                member: self.members[self.local_index],
                reason: e.to_string(),
            })?
        }
        debug!("published generation {}", generation);
        Ok(())
    }

    async fn synchronize(&mut self) -> Result<(), Error> {
        if self.rows[self.local_index].generation == 0 {
            Err(ConfigurationError::SynchronizeBeforePublish)?
        }
        while !self.all_published() {
            match self.link.recv().await {
                Some(frame) => self.apply(frame)?,
                None => Err(Error::Disconnected)?,
            }
        }
        // a member may have published and then abandoned the round
        while let Some(frame) = self.link.try_recv() {
            self.apply(frame)?;
        }
        debug!("all {} rows published", self.rows.len());
        Ok(())
    }

    fn read(&self, member_index: usize, column: usize) -> Result<f64, Error> {
        let row = self.rows.get(member_index).ok_or(
            ConfigurationError::MemberIndexOutOfRange {
                index: member_index,
                members: self.rows.len(),
            },
        )?;
        let value = row.values.get(column).ok_or(
            ConfigurationError::ColumnOutOfRange {
                column,
                columns: self.column_count,
            },
        )?;
        Ok(*value)
    }

    fn unpublished(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.generation == 0)
            .map(|(index, _)| index)
            .collect()
    }

    async fn abort(&mut self, reason: AbortReason) {
        let frame = Frame::abort(
            self.link.round(),
            self.members.digest(),
            self.members[self.local_index],
            reason,
        );
        if let Err(e) = self.link.broadcast(frame).await {
            warn!("Could not tell peers the round was abandoned: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::group::GroupDigest;

    /// A link that replays scripted frames and records what was broadcast.
    struct ScriptedLink {
        incoming: VecDeque<Frame>,
        sent: Vec<Frame>,
        fail_broadcast: bool,
    }

    impl ScriptedLink {
        fn new(incoming: Vec<Frame>) -> Self {
            Self {
                incoming: incoming.into(),
                sent: Vec::new(),
                fail_broadcast: false,
            }
        }
    }

    #[async_trait]
    impl Link for ScriptedLink {
        fn round(&self) -> u64 {
            1
        }

        async fn broadcast(&mut self, frame: Frame) -> Result<(), Error> {
            if self.fail_broadcast {
                return Err(Error::Disconnected);
            }
            self.sent.push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Frame> {
            self.incoming.pop_front()
        }

        fn try_recv(&mut self) -> Option<Frame> {
            self.incoming.pop_front()
        }
    }

    fn members() -> MemberList {
        MemberList::new(vec![10, 11, 12]).unwrap()
    }

    fn row(from: u32, generation: u64, values: Vec<f64>) -> Frame {
        Frame::row(1, members().digest(), from, generation, values)
    }

    #[tokio::test]
    async fn applies_rows_until_everyone_published() {
        let link = ScriptedLink::new(vec![
            row(12, 1, vec![3.0]),
            row(10, 1, vec![1.0]),
        ]);
        let mut table = ReplicaTable::new(members(), 1, 1, link).unwrap();
        table.write_local(0, 2.0).unwrap();
        table.publish().await.unwrap();
        assert_eq!(table.unpublished(), vec![0, 2]);
        assert_eq!(table.unpublished_members(), vec![10, 12]);

        table.synchronize().await.unwrap();
        assert!(table.unpublished().is_empty());
        let col: Vec<f64> =
            (0..3).map(|m| table.read(m, 0).unwrap()).collect();
        assert_eq!(col, vec![1.0, 2.0, 3.0]);

        assert_eq!(table.link.sent.len(), 1);
        assert_eq!(
            table.link.sent[0].body,
            FrameBody::Row {
                generation: 1,
                values: vec![2.0]
            }
        );
    }

    #[tokio::test]
    async fn newer_generation_wins_and_stale_is_dropped() {
        let link = ScriptedLink::new(vec![
            row(10, 2, vec![5.0]),
            row(10, 1, vec![1.0]),
            row(11, 1, vec![9.0]),
            row(12, 1, vec![7.0]),
        ]);
        let mut table = ReplicaTable::new(members(), 1, 1, link).unwrap();
        table.publish().await.unwrap();
        table.synchronize().await.unwrap();
        assert_eq!(table.read(0, 0).unwrap(), 5.0);
        assert_eq!(table.read(2, 0).unwrap(), 7.0);
    }

    #[tokio::test]
    async fn rejects_disagreeing_peers() {
        let other = Frame::row(1, GroupDigest::of(&[1, 2]), 10, 1, vec![1.0]);
        let mut table =
            ReplicaTable::new(members(), 1, 1, ScriptedLink::new(vec![other]))
                .unwrap();
        table.publish().await.unwrap();
        assert!(matches!(
            table.synchronize().await,
            Err(Error::MembershipMismatch { member: 10 })
        ));

        let wide = row(10, 1, vec![1.0, 2.0]);
        let mut table =
            ReplicaTable::new(members(), 1, 1, ScriptedLink::new(vec![wide]))
                .unwrap();
        table.publish().await.unwrap();
        assert!(matches!(
            table.synchronize().await,
            Err(Error::ColumnMismatch {
                member: 10,
                expected: 1,
                got: 2
            })
        ));
    }

    #[tokio::test]
    async fn abort_notices_fail_the_round() {
        let digest = members().digest();
        let link = ScriptedLink::new(vec![Frame::abort(
            1,
            digest,
            12,
            AbortReason::PublishFailed,
        )]);
        let mut table = ReplicaTable::new(members(), 0, 1, link).unwrap();
        table.publish().await.unwrap();
        assert!(matches!(
            table.synchronize().await,
            Err(Error::PublishFailure { member: 12, .. })
        ));

        let link = ScriptedLink::new(vec![Frame::abort(
            1,
            digest,
            12,
            AbortReason::Cancelled,
        )]);
        let mut table = ReplicaTable::new(members(), 0, 1, link).unwrap();
        table.publish().await.unwrap();
        assert!(matches!(
            table.synchronize().await,
            Err(Error::PeerAborted {
                member: 12,
                reason: AbortReason::Cancelled
            })
        ));
    }

    #[tokio::test]
    async fn abort_after_publishing_still_fails_the_round() {
        let digest = members().digest();
        let link = ScriptedLink::new(vec![
            row(10, 1, vec![1.0]),
            row(12, 1, vec![3.0]),
            Frame::abort(1, digest, 10, AbortReason::Cancelled),
        ]);
        let mut table = ReplicaTable::new(members(), 1, 1, link).unwrap();
        table.publish().await.unwrap();
        assert!(matches!(
            table.synchronize().await,
            Err(Error::PeerAborted {
                member: 10,
                reason: AbortReason::Cancelled
            })
        ));
    }

    #[tokio::test]
    async fn contract_violations() {
        let mut table =
            ReplicaTable::new(members(), 0, 2, ScriptedLink::new(vec![]))
                .unwrap();
        assert!(matches!(
            table.write_local(2, 1.0),
            Err(Error::Configuration(ConfigurationError::ColumnOutOfRange {
                column: 2,
                columns: 2
            }))
        ));
        assert!(matches!(
            table.read(3, 0),
            Err(Error::Configuration(
                ConfigurationError::MemberIndexOutOfRange { .. }
            ))
        ));
        assert!(matches!(
            table.synchronize().await,
            Err(Error::Configuration(
                ConfigurationError::SynchronizeBeforePublish
            ))
        ));
        table.publish().await.unwrap();
        // the script is exhausted, like a closed transport
        assert!(matches!(
            table.synchronize().await,
            Err(Error::Disconnected)
        ));

        assert!(matches!(
            ReplicaTable::new(members(), 3, 1, ScriptedLink::new(vec![])),
            Err(ConfigurationError::LocalIndexOutOfRange { .. })
        ));
        assert!(matches!(
            ReplicaTable::new(members(), 0, 0, ScriptedLink::new(vec![])),
            Err(ConfigurationError::NoColumns)
        ));
    }

    #[tokio::test]
    async fn failed_publish_leaves_row_unpublished() {
        let mut link = ScriptedLink::new(vec![]);
        link.fail_broadcast = true;
        let mut table = ReplicaTable::new(members(), 2, 1, link).unwrap();
        assert!(matches!(
            table.publish().await,
            Err(Error::PublishFailure { member: 12, .. })
        ));
        assert_eq!(table.unpublished(), vec![0, 1, 2]);
    }
}

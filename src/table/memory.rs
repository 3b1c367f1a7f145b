//! An in-process transport: every member is an endpoint on a shared hub of
//! unbounded channels. Used by the `local` CLI mode and throughout the tests,
//! where it can also inject publish faults and scramble delivery order.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use super::{
    inbox::Inbox,
    wire::{Frame, FrameBody},
    Link, ReplicaTable, TableProvider,
};
use crate::{
    error::{ConfigurationError, Error},
    group::{MemberId, MemberList},
};

/// What to break for a member.
#[derive(Clone, Copy, Debug, Default)]
struct Fault {
    /// Row broadcasts from the member fail.
    fail_rows: bool,
    /// Abort notices from the member fail too.
    fail_aborts: bool,
}

#[derive(Default)]
struct Hub {
    mailboxes: RwLock<HashMap<MemberId, mpsc::UnboundedSender<Frame>>>,
    faults: RwLock<HashMap<MemberId, Fault>>,
    max_delay: Option<Duration>,
}

/// Can be cloned to obtain another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network that delays every delivery by a random amount below
    /// `max_delay`, so frames arrive in arbitrary order.
    pub fn with_max_delay(max_delay: Duration) -> Self {
        Self {
            hub: Arc::new(Hub {
                max_delay: Some(max_delay),
                ..Hub::default()
            }),
        }
    }

    /// Registers `id` on the network. Joining again replaces the previous
    /// endpoint's mailbox.
    pub async fn join(&self, id: MemberId) -> MemoryEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.mailboxes.write().await.insert(id, tx);
        debug!("member {} joined the memory network", id);
        MemoryEndpoint {
            id,
            network: self.clone(),
            inbox: Arc::new(Mutex::new(Inbox::new(rx))),
            rounds: AtomicU64::new(0),
        }
    }

    /// Makes every row publish from `id` fail. If `notify_peers` is false the
    /// member's abort notices are lost as well, leaving its peers to time out.
    pub async fn fail_publishes(&self, id: MemberId, notify_peers: bool) {
        self.hub.faults.write().await.insert(
            id,
            Fault {
                fail_rows: true,
                fail_aborts: !notify_peers,
            },
        );
    }

    pub async fn heal(&self, id: MemberId) {
        self.hub.faults.write().await.remove(&id);
    }

    async fn deliver(
        &self,
        from: MemberId,
        to: &[MemberId],
        frame: Frame,
    ) -> Result<(), Error> {
        let fault = self
            .hub
            .faults
            .read()
            .await
            .get(&from)
            .copied()
            .unwrap_or_default();
        let failed = match frame.body {
            FrameBody::Row { .. } => fault.fail_rows,
            FrameBody::Abort(_) => fault.fail_aborts,
        };
        if failed {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("injected fault for member {}", from),
            ))?
        }

        let mailboxes = self.hub.mailboxes.read().await;
        let mut first_error: Option<Error> = None;
        for id in to {
            let tx = match mailboxes.get(id) {
                Some(tx) => tx,
                None => {
                    first_error.get_or_insert(
                        ConfigurationError::UnknownMember(*id).into(),
                    );
                    continue;
                }
            };
            match self.hub.max_delay {
                Some(max_delay) => {
                    let delay = rand::thread_rng().gen_range(
                        Duration::ZERO..=max_delay,
                    );
                    let tx = tx.clone();
                    let frame = frame.clone();
                    let id = *id;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if tx.send(frame).is_err() {
                            warn!("member {} left the memory network", id);
                        }
                    });
                }
                None => {
                    if tx.send(frame.clone()).is_err() {
                        warn!("member {} left the memory network", id);
                        first_error.get_or_insert(Error::Disconnected);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// One member's attachment to a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    id: MemberId,
    network: MemoryNetwork,
    inbox: Arc<Mutex<Inbox>>,
    rounds: AtomicU64,
}

impl MemoryEndpoint {
    pub fn id(&self) -> MemberId {
        self.id
    }
}

#[async_trait]
impl TableProvider for MemoryEndpoint {
    type Table = ReplicaTable<MemoryLink>;

    async fn construct(
        &self,
        members: &MemberList,
        local_index: usize,
        column_count: usize,
    ) -> Result<Self::Table, Error> {
        members.check_local(local_index, self.id)?;
        if column_count == 0 {
            Err(ConfigurationError::NoColumns)?
        }
        {
            let mailboxes = self.network.hub.mailboxes.read().await;
            let missing = members.iter().find(|id| !mailboxes.contains_key(id));
            if let Some(id) = missing {
                Err(ConfigurationError::UnknownMember(id))?
            }
        }

        // one round at a time per endpoint
        let mut inbox = self.inbox.clone().lock_owned().await;
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        inbox.start_round(round);

        let peers = members
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != local_index)
            .map(|(_, id)| id)
            .collect();
        let link = MemoryLink {
            from: members[local_index],
            peers,
            round,
            network: self.network.clone(),
            inbox,
        };
        Ok(ReplicaTable::new(
            members.clone(),
            local_index,
            column_count,
            link,
        )?)
    }
}

pub struct MemoryLink {
    from: MemberId,
    peers: Vec<MemberId>,
    round: u64,
    network: MemoryNetwork,
    inbox: OwnedMutexGuard<Inbox>,
}

#[async_trait]
impl Link for MemoryLink {
    fn round(&self) -> u64 {
        self.round
    }

    async fn broadcast(&mut self, frame: Frame) -> Result<(), Error> {
        self.network.deliver(self.from, &self.peers, frame).await
    }

    async fn recv(&mut self) -> Option<Frame> {
        self.inbox.next_for(self.round).await
    }

    fn try_recv(&mut self) -> Option<Frame> {
        self.inbox.try_next_for(self.round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ResultTable;

    #[tokio::test]
    async fn rows_reach_every_member() {
        let network = MemoryNetwork::new();
        let a = network.join(1).await;
        let b = network.join(2).await;
        let members = MemberList::new(vec![1, 2]).unwrap();

        let mut ta = a.construct(&members, 0, 1).await.unwrap();
        let mut tb = b.construct(&members, 1, 1).await.unwrap();
        ta.write_local(0, 4.0).unwrap();
        tb.write_local(0, 6.0).unwrap();
        ta.publish().await.unwrap();
        tb.publish().await.unwrap();
        ta.synchronize().await.unwrap();
        tb.synchronize().await.unwrap();

        assert_eq!(ta.read(1, 0).unwrap(), 6.0);
        assert_eq!(tb.read(0, 0).unwrap(), 4.0);
    }

    #[tokio::test]
    async fn rejects_members_without_endpoint() {
        let network = MemoryNetwork::new();
        let a = network.join(1).await;
        let members = MemberList::new(vec![1, 9]).unwrap();
        assert!(matches!(
            a.construct(&members, 0, 1).await,
            Err(Error::Configuration(ConfigurationError::UnknownMember(9)))
        ));
        assert!(matches!(
            a.construct(&members, 1, 1).await,
            Err(Error::Configuration(ConfigurationError::NotLocalMember {
                index: 1,
                owner: 9,
                local: 1
            }))
        ));
    }

    #[tokio::test]
    async fn departed_member_does_not_starve_the_rest() {
        let network = MemoryNetwork::new();
        let a = network.join(1).await;
        let b = network.join(2).await;
        let c = network.join(3).await;
        let members = MemberList::new(vec![1, 2, 3]).unwrap();
        drop(b);

        let mut ta = a.construct(&members, 0, 1).await.unwrap();
        ta.write_local(0, 5.0).unwrap();
        assert!(matches!(
            ta.publish().await,
            Err(Error::PublishFailure { member: 1, .. })
        ));

        // the row still reached the member listed after the departed one
        let frame = c.inbox.lock().await.try_next_for(1).unwrap();
        assert_eq!(frame.from, 1);
        assert_eq!(
            frame.body,
            FrameBody::Row {
                generation: 1,
                values: vec![5.0]
            }
        );
    }

    #[tokio::test]
    async fn injected_faults() {
        let network = MemoryNetwork::new();
        let a = network.join(1).await;
        let _b = network.join(2).await;
        let members = MemberList::new(vec![1, 2]).unwrap();
        network.fail_publishes(1, true).await;

        let mut table = a.construct(&members, 0, 1).await.unwrap();
        assert!(matches!(
            table.publish().await,
            Err(Error::PublishFailure { member: 1, .. })
        ));

        network.heal(1).await;
        table.publish().await.unwrap();
    }

    #[tokio::test]
    async fn later_rounds_wait_for_their_table() {
        let network = MemoryNetwork::new();
        let a = network.join(1).await;
        let b = network.join(2).await;
        let members = MemberList::new(vec![1, 2]).unwrap();

        // b races through its first round and publishes for the second one
        // before a has built its first table
        let mut b1 = b.construct(&members, 1, 1).await.unwrap();
        b1.write_local(0, 1.0).unwrap();
        b1.publish().await.unwrap();
        drop(b1);
        let mut b2 = b.construct(&members, 1, 1).await.unwrap();
        b2.write_local(0, 2.0).unwrap();
        b2.publish().await.unwrap();

        let mut a1 = a.construct(&members, 0, 1).await.unwrap();
        a1.publish().await.unwrap();
        a1.synchronize().await.unwrap();
        assert_eq!(a1.read(1, 0).unwrap(), 1.0);
        drop(a1);

        let mut a2 = a.construct(&members, 0, 1).await.unwrap();
        a2.publish().await.unwrap();
        a2.synchronize().await.unwrap();
        assert_eq!(a2.read(1, 0).unwrap(), 2.0);
    }
}

use std::{fmt, ops::Index};

use hashbrown::HashSet;

use crate::error::ConfigurationError;

/// A node identifier, as handed out by the group layer.
pub type MemberId = u32;

/// The ordered, duplicate-free member list a round reduces over. The member at
/// position `i` owns row `i` of the round's table.
///
/// Every member must build the list with the same content in the same order.
/// The [`GroupDigest`] travels with every published row so that a member with
/// a different view is caught instead of silently folding other rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberList {
    members: Vec<MemberId>,
    digest: GroupDigest,
}

impl MemberList {
    pub fn new(members: Vec<MemberId>) -> Result<Self, ConfigurationError> {
        if members.is_empty() {
            Err(ConfigurationError::EmptyMemberList)?
        }
        let mut seen = HashSet::with_capacity(members.len());
        for id in &members {
            if !seen.insert(*id) {
                Err(ConfigurationError::DuplicateMember(*id))?
            }
        }
        let digest = GroupDigest::of(&members);
        Ok(Self { members, digest })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a constructed list.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<MemberId> {
        self.members.get(index).copied()
    }

    pub fn index_of(&self, id: MemberId) -> Option<usize> {
        self.members.iter().position(|m| *m == id)
    }

    /// Checks that `index` is a valid row for this list.
    pub fn check_index(&self, index: usize) -> Result<(), ConfigurationError> {
        if index < self.members.len() {
            Ok(())
        } else {
            Err(ConfigurationError::LocalIndexOutOfRange {
                index,
                members: self.members.len(),
            })
        }
    }

    /// Checks that row `index` is owned by `local`.
    pub fn check_local(
        &self,
        index: usize,
        local: MemberId,
    ) -> Result<(), ConfigurationError> {
        self.check_index(index)?;
        if self.members[index] != local {
            Err(ConfigurationError::NotLocalMember {
                index,
                owner: self.members[index],
                local,
            })?
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.members.iter().copied()
    }

    pub fn as_slice(&self) -> &[MemberId] {
        &self.members
    }

    pub fn digest(&self) -> GroupDigest {
        self.digest
    }
}

impl Index<usize> for MemberList {
    type Output = MemberId;

    fn index(&self, index: usize) -> &MemberId {
        &self.members[index]
    }
}

impl TryFrom<Vec<MemberId>> for MemberList {
    type Error = ConfigurationError;

    fn try_from(members: Vec<MemberId>) -> Result<Self, Self::Error> {
        Self::new(members)
    }
}

/// BLAKE3 digest of a member list, order included.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupDigest(pub [u8; 32]);

impl GroupDigest {
    pub fn of(members: &[MemberId]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for id in members {
            hasher.update(&id.to_le_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Logs only need enough of the digest to tell groups apart.
impl fmt::Display for GroupDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GroupDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupDigest(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_duplicate_lists() {
        assert_eq!(
            MemberList::new(vec![]),
            Err(ConfigurationError::EmptyMemberList)
        );
        assert_eq!(
            MemberList::new(vec![3, 7, 3]),
            Err(ConfigurationError::DuplicateMember(3))
        );
    }

    #[test]
    fn digest_depends_on_order() {
        let a = MemberList::new(vec![1, 2, 3]).unwrap();
        let b = MemberList::new(vec![1, 2, 3]).unwrap();
        let c = MemberList::new(vec![3, 2, 1]).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn positions() {
        let members = MemberList::new(vec![10, 20, 30]).unwrap();
        assert_eq!(members.index_of(20), Some(1));
        assert_eq!(members.index_of(40), None);
        assert_eq!(members[2], 30);
        assert!(members.check_index(2).is_ok());
        assert_eq!(
            members.check_index(3),
            Err(ConfigurationError::LocalIndexOutOfRange {
                index: 3,
                members: 3
            })
        );
        assert!(members.check_local(1, 20).is_ok());
        assert_eq!(
            members.check_local(1, 30),
            Err(ConfigurationError::NotLocalMember {
                index: 1,
                owner: 20,
                local: 30
            })
        );
        assert_eq!(members.digest().to_string().len(), 12);
    }
}

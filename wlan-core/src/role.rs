//! Interface roles a radio can host, and small sets of them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The function an interface instance serves on a radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InterfaceRole {
    Station,
    AccessPoint,
    P2pGroupOwner,
    P2pClient,
    /// Wi-Fi-Direct discovery device (no data path).
    P2pDevice,
    Adhoc,
}

impl InterfaceRole {
    pub const ALL: [InterfaceRole; 6] = [
        InterfaceRole::Station,
        InterfaceRole::AccessPoint,
        InterfaceRole::P2pGroupOwner,
        InterfaceRole::P2pClient,
        InterfaceRole::P2pDevice,
        InterfaceRole::Adhoc,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for InterfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterfaceRole::Station => "station",
            InterfaceRole::AccessPoint => "ap",
            InterfaceRole::P2pGroupOwner => "p2p-go",
            InterfaceRole::P2pClient => "p2p-client",
            InterfaceRole::P2pDevice => "p2p-device",
            InterfaceRole::Adhoc => "adhoc",
        };
        f.write_str(s)
    }
}

/// Set of interface roles, stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleSet(u8);

impl RoleSet {
    pub const fn empty() -> Self {
        RoleSet(0)
    }

    pub fn of(roles: &[InterfaceRole]) -> Self {
        roles.iter().copied().collect()
    }

    pub fn insert(&mut self, role: InterfaceRole) {
        self.0 |= role.bit();
    }

    pub fn contains(&self, role: InterfaceRole) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = InterfaceRole> + '_ {
        InterfaceRole::ALL.into_iter().filter(|r| self.contains(*r))
    }
}

impl FromIterator<InterfaceRole> for RoleSet {
    fn from_iter<I: IntoIterator<Item = InterfaceRole>>(iter: I) -> Self {
        let mut set = RoleSet::empty();
        for role in iter {
            set.insert(role);
        }
        set
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, role) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", role)?;
        }
        f.write_str("}")
    }
}

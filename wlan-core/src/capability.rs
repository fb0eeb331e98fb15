//! Capability catalog: turns driver capability dumps into per-radio role and band tables.
//!
//! A dump may arrive in several parts. Parts for one phy are merged and stay provisional
//! until the driver signals that the dump is complete.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::combination::{CombinationSet, ConcurrencyCombination};
use crate::role::{InterfaceRole, RoleSet};

/// Index of a physical radio.
pub type PhyIndex = u32;

pub const FREQ_FLAG_DISABLED: u32 = 1 << 0;
pub const FREQ_FLAG_NO_IR: u32 = 1 << 1;
pub const FREQ_FLAG_RADAR: u32 = 1 << 2;

/// Frequency entry as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrequency {
    pub mhz: u32,
    pub flags: u32,
}

/// One event of the capability protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityMessage {
    /// One part of a (possibly multi-part) dump for a phy.
    Wiphy {
        phy: PhyIndex,
        name: Option<String>,
        supported_roles: Vec<InterfaceRole>,
        combinations: Vec<ConcurrencyCombination>,
        frequencies: Vec<RawFrequency>,
    },
    /// All parts for this phy have been sent.
    DumpComplete { phy: PhyIndex },
    /// The phy is gone.
    Removed { phy: PhyIndex },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BandKind {
    Band2Ghz,
    Band5Ghz,
    Band6Ghz,
    Band60Ghz,
}

impl BandKind {
    pub fn for_frequency(mhz: u32) -> Option<BandKind> {
        match mhz {
            2400..=2500 => Some(BandKind::Band2Ghz),
            4900..=5924 => Some(BandKind::Band5Ghz),
            5925..=7125 => Some(BandKind::Band6Ghz),
            57000..=71000 => Some(BandKind::Band60Ghz),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub mhz: u32,
    pub disabled: bool,
    pub no_ir: bool,
    pub radar: bool,
}

impl Channel {
    fn from_raw(raw: RawFrequency) -> Self {
        Self {
            mhz: raw.mhz,
            disabled: raw.flags & FREQ_FLAG_DISABLED != 0,
            no_ir: raw.flags & FREQ_FLAG_NO_IR != 0,
            radar: raw.flags & FREQ_FLAG_RADAR != 0,
        }
    }

    /// Usable for beaconing (AP / group owner).
    pub fn can_initiate(&self) -> bool {
        !self.disabled && !self.no_ir && !self.radar
    }
}

/// Parsed capabilities of one radio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhyCapabilities {
    pub phy: PhyIndex,
    pub name: Option<String>,
    pub supported_roles: RoleSet,
    pub combinations: CombinationSet,
    pub bands: BTreeMap<BandKind, Vec<Channel>>,
}

impl PhyCapabilities {
    pub fn supports_role(&self, role: InterfaceRole) -> bool {
        self.supported_roles.contains(role)
    }

    /// Frequencies on which this radio may start a group or an access point.
    pub fn initiating_frequencies(&self) -> Vec<u32> {
        self.bands
            .values()
            .flatten()
            .filter(|c| c.can_initiate())
            .map(|c| c.mhz)
            .collect()
    }
}

/// Outcome of feeding one capability message to the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityUpdate {
    /// Part merged; data still provisional.
    Pending,
    /// Dump complete; these capabilities replace any earlier ones for the phy.
    Complete(PhyCapabilities),
    Removed(PhyIndex),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("dump complete for phy{0} without any dump part")]
    NoPendingDump(PhyIndex),
}

/// Merges multi-part dumps per phy.
#[derive(Debug, Default)]
pub struct CapabilityAssembler {
    pending: HashMap<PhyIndex, PhyCapabilities>,
}

impl CapabilityAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending(&self, phy: PhyIndex) -> bool {
        self.pending.contains_key(&phy)
    }

    pub fn feed(&mut self, msg: CapabilityMessage) -> Result<CapabilityUpdate, CapabilityError> {
        match msg {
            CapabilityMessage::Wiphy {
                phy,
                name,
                supported_roles,
                combinations,
                frequencies,
            } => {
                let entry = self.pending.entry(phy).or_insert_with(|| PhyCapabilities {
                    phy,
                    ..Default::default()
                });
                if name.is_some() {
                    entry.name = name;
                }
                for role in supported_roles {
                    entry.supported_roles.insert(role);
                }
                if !combinations.is_empty() {
                    let mut merged: Vec<ConcurrencyCombination> =
                        entry.combinations.iter().cloned().collect();
                    merged.extend(combinations);
                    entry.combinations = CombinationSet::new(merged);
                }
                for raw in frequencies {
                    match BandKind::for_frequency(raw.mhz) {
                        Some(kind) => {
                            let channels = entry.bands.entry(kind).or_default();
                            if !channels.iter().any(|c| c.mhz == raw.mhz) {
                                channels.push(Channel::from_raw(raw));
                            }
                        }
                        None => debug!(phy, mhz = raw.mhz, "frequency outside known bands"),
                    }
                }
                Ok(CapabilityUpdate::Pending)
            }
            CapabilityMessage::DumpComplete { phy } => match self.pending.remove(&phy) {
                Some(caps) => {
                    debug!(
                        phy,
                        roles = %caps.supported_roles,
                        combinations = caps.combinations.len(),
                        "capability dump complete"
                    );
                    Ok(CapabilityUpdate::Complete(caps))
                }
                None => {
                    warn!(phy, "dump complete without pending dump");
                    Err(CapabilityError::NoPendingDump(phy))
                }
            },
            CapabilityMessage::Removed { phy } => {
                self.pending.remove(&phy);
                Ok(CapabilityUpdate::Removed(phy))
            }
        }
    }
}

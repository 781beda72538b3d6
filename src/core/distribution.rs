// src/core/distribution.rs

//! Static distribution map: key → slot, slot → responsible servers, self and
//! common slots. Loaded once at startup from the `[mirror]` registry and
//! immutable afterwards; resharding is an offline operation.

use crate::config::MirrorConfig;
use crate::core::clock::now_us;
use crate::core::errors::NetCacheError;
use crate::core::storage::{BlobKey, GENERATED_KEY_PREFIX};
use crc::{CRC_32_ISO_HDLC, Crc};
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};

/// The CRC32 flavor used to map user keys onto slots.
const CRC32_ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A server identity: IPv4 address in the upper half, control port in the
/// lower half. Totally ordered, used as a conflict tiebreaker.
pub type ServerId = u64;

pub fn make_server_id(ip: Ipv4Addr, port: u16) -> ServerId {
    ((u32::from(ip) as u64) << 32) | port as u64
}

pub fn server_id_addr(id: ServerId) -> SocketAddr {
    let ip = Ipv4Addr::from((id >> 32) as u32);
    SocketAddr::from((ip, id as u16))
}

fn resolve_host(host: &str) -> Result<Ipv4Addr, NetCacheError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| NetCacheError::Config(format!("host does not exist ({host}): {e}")))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(NetCacheError::Config(format!(
        "host does not exist ({host}): no IPv4 address"
    )))
}

#[derive(Debug, Clone)]
struct SrvGroupInfo {
    srv_id: ServerId,
    group: String,
}

/// The resolved, immutable distribution map.
#[derive(Debug)]
pub struct DistributionMap {
    self_id: ServerId,
    self_host_ip: String,
    self_group: String,
    self_slots: Vec<u16>,
    /// Non-self servers per slot with their group, for read fan-out ordering.
    slot_servers: HashMap<u16, Vec<SrvGroupInfo>>,
    /// Non-self servers per slot, the mirror fan-out target set.
    raw_slot_servers: HashMap<u16, Vec<ServerId>>,
    /// Slots served by both the local node and the given peer.
    common_slots: HashMap<ServerId, Vec<u16>>,
    /// peer id → "host:port" display name.
    peers: HashMap<ServerId, String>,
    max_slot_number: u16,
    /// Share of the 32-bit token space owned by each slot.
    slot_rnd_share: u32,
    blob_id: AtomicU64,
}

impl DistributionMap {
    /// Builds the map from configuration. The local node must appear in the
    /// registry unless no servers are configured at all, in which case a
    /// single self-served slot is synthesized.
    pub fn new(mirror: &MirrorConfig, control_port: u16) -> Result<Self, NetCacheError> {
        let mut found_self = false;
        let mut self_group = String::new();
        let mut self_host_ip = "127.0.0.1".to_string();
        let mut self_slots: Vec<u16> = Vec::new();
        let mut slot_servers: HashMap<u16, Vec<SrvGroupInfo>> = HashMap::new();
        let mut raw_slot_servers: HashMap<u16, Vec<ServerId>> = HashMap::new();
        let mut peers: HashMap<ServerId, String> = HashMap::new();
        let mut max_slot_number: u16 = 0;

        for entry in &mirror.servers {
            let host = resolve_host(&entry.host)?;
            let srv_id = make_server_id(host, entry.port);
            let is_self = entry.port == control_port && is_local_addr(host);
            if is_self {
                found_self = true;
                self_group = entry.group.clone();
                self_host_ip = host.to_string();
            } else {
                peers.insert(srv_id, format!("{}:{}", entry.host, entry.port));
            }

            for &slot in &entry.slots {
                let srvs = raw_slot_servers.entry(slot).or_default();
                if is_self {
                    self_slots.push(slot);
                } else {
                    if srvs.contains(&srv_id) {
                        return Err(NetCacheError::Config(format!(
                            "slot {slot} provided twice for server {}:{}",
                            entry.host, entry.port
                        )));
                    }
                    srvs.push(srv_id);
                    slot_servers.entry(slot).or_default().push(SrvGroupInfo {
                        srv_id,
                        group: entry.group.clone(),
                    });
                }
                max_slot_number = max_slot_number.max(slot);
            }
        }

        let slot_rnd_share = if max_slot_number <= 1 {
            max_slot_number = max_slot_number.max(1);
            u32::MAX
        } else {
            u32::MAX / max_slot_number as u32 + 1
        };

        if !found_self {
            if !peers.is_empty() {
                return Err(NetCacheError::Config(format!(
                    "no description found for itself (port {control_port})"
                )));
            }
            self_slots.push(1);
            self_group = "grp1".to_string();
        }

        let mut common_slots: HashMap<ServerId, Vec<u16>> = HashMap::new();
        for &srv_id in peers.keys() {
            let mut commons: Vec<u16> = Vec::new();
            for (&slot, srvs) in &raw_slot_servers {
                if self_slots.contains(&slot) && srvs.contains(&srv_id) {
                    commons.push(slot);
                }
            }
            commons.sort_unstable();
            common_slots.insert(srv_id, commons);
        }

        let self_ip = resolve_host(&self_host_ip).unwrap_or(Ipv4Addr::LOCALHOST);
        Ok(Self {
            self_id: make_server_id(self_ip, control_port),
            self_host_ip,
            self_group,
            self_slots,
            slot_servers,
            raw_slot_servers,
            common_slots,
            peers,
            max_slot_number,
            slot_rnd_share,
            blob_id: AtomicU64::new(0),
        })
    }

    pub fn self_id(&self) -> ServerId {
        self.self_id
    }

    pub fn max_slot_number(&self) -> u16 {
        self.max_slot_number
    }

    pub fn peers(&self) -> &HashMap<ServerId, String> {
        &self.peers
    }

    /// Peer display name, or empty when unknown.
    pub fn peer_name(&self, srv_id: ServerId) -> String {
        self.peers.get(&srv_id).cloned().unwrap_or_default()
    }

    pub fn self_slots(&self) -> &[u16] {
        &self.self_slots
    }

    pub fn is_served_locally(&self, slot: u16) -> bool {
        self.self_slots.contains(&slot)
    }

    pub fn common_slots(&self, srv_id: ServerId) -> &[u16] {
        self.common_slots.get(&srv_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Derives the slot of a key: generated keys carry their token, user keys
    /// hash through CRC32. Deterministic and identical on every node.
    pub fn slot_of(&self, key: &BlobKey) -> u16 {
        let token = if key.is_generated() {
            key.key
                .rsplit('_')
                .next()
                .and_then(|tok| tok.parse::<u32>().ok())
                .unwrap_or_else(|| CRC32_ALGO.checksum(key.raw().as_bytes()))
        } else {
            CRC32_ALGO.checksum(key.raw().as_bytes())
        };
        // Slot numbers are 1-based.
        (token / self.slot_rnd_share) as u16 + 1
    }

    /// Servers to try for a remote read: randomized, own group first.
    pub fn servers_for_slot(&self, slot: u16) -> Vec<ServerId> {
        let Some(srvs) = self.slot_servers.get(&slot) else {
            return Vec::new();
        };
        let mut shuffled = srvs.clone();
        {
            use rand::seq::SliceRandom;
            shuffled.shuffle(&mut rand::thread_rng());
        }
        let mut result: Vec<ServerId> = shuffled
            .iter()
            .filter(|s| s.group == self.self_group)
            .map(|s| s.srv_id)
            .collect();
        result.extend(
            shuffled
                .iter()
                .filter(|s| s.group != self.self_group)
                .map(|s| s.srv_id),
        );
        result
    }

    /// The mirror fan-out target set for one slot, in configuration order.
    pub fn raw_servers_for_slot(&self, slot: u16) -> Vec<ServerId> {
        self.raw_slot_servers.get(&slot).cloned().unwrap_or_default()
    }

    /// Generates a fresh self-describing blob key whose token lands in one of
    /// the self slots.
    pub fn generate_blob_key(&self, local_port: u16) -> String {
        let rnd: u32 = rand::thread_rng().r#gen();

        let cnt_pieces = self.self_slots.len() as u32;
        let piece_share = u32::MAX / cnt_pieces + 1;
        let index = rnd / piece_share;
        let rnd = rnd - index * piece_share;
        let slot = self.self_slots[index as usize];
        // The last slot's share may be a little short of the full token
        // space; cap instead of wrapping into slot 1.
        let key_rnd = ((slot as u64 - 1) * self.slot_rnd_share as u64
            + (rnd % self.slot_rnd_share) as u64)
            .min(u32::MAX as u64) as u32;

        let blob_id = self.blob_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{}{}_{}_{}_{}_{}",
            GENERATED_KEY_PREFIX,
            blob_id,
            self.self_host_ip,
            local_port,
            now_us() / 1_000_000,
            key_rnd
        )
    }

    /// The server a generated key was born on; 0 for user keys.
    pub fn main_server_of(&self, key: &BlobKey) -> ServerId {
        if !key.is_generated() {
            return 0;
        }
        // Layout: NC_1_<id>_<host>_<port>_<time>_<token>
        let fields: Vec<&str> = key.key.split('_').collect();
        if fields.len() < 7 {
            return 0;
        }
        let Ok(ip) = fields[3].parse::<Ipv4Addr>() else {
            return 0;
        };
        let Ok(port) = fields[4].parse::<u16>() else {
            return 0;
        };
        make_server_id(ip, port)
    }
}

/// Whether the resolved address can describe this node. Hostname aliasing is
/// collapsed to loopback plus exact-IP matches; multi-homed setups must list
/// the interface address in the registry.
fn is_local_addr(ip: Ipv4Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    local_ipv4_addrs().contains(&ip)
}

fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    // Best-effort discovery without an interface-enumeration dependency: a
    // connected UDP socket reveals the primary outbound address.
    let mut addrs = Vec::new();
    if let Ok(sock) = std::net::UdpSocket::bind(("0.0.0.0", 0)) {
        if sock.connect(("198.51.100.1", 9)).is_ok() {
            if let Ok(SocketAddr::V4(v4)) = sock.local_addr() {
                addrs.push(*v4.ip());
            }
        }
    }
    addrs
}

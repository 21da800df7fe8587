use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::{fmt, hash::Hash, ops::Range};
use thiserror::Error;
use tracing::debug;

/// Ports that may be leased, excluding privileged and ephemeral ports.
pub const PORT_RANGE: Range<u16> = 1024..49152;

/// Random draws attempted before falling back to a linear scan.
const RANDOM_ATTEMPTS: usize = 40;

/// Leases unique ports to named holders.
#[derive(Debug)]
pub struct PortManager<K> {
    leases: Mutex<Leases<K>>,
}

#[derive(Debug)]
struct Leases<K> {
    by_port: PortMap<K>,
    by_holder: HashMap<K, u16>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LeaseError<K: fmt::Display + fmt::Debug> {
    #[error("port {port} is already leased to {holder}")]
    Conflict { port: u16, holder: K },

    #[error("all ports in {}..{} are leased", PORT_RANGE.start, PORT_RANGE.end)]
    Exhausted,
}

/// A `HashMap` specialized for ports.
///
/// Because ports are `u16` values, this type avoids the overhead of actually
/// hashing ports.
type PortMap<V> = std::collections::HashMap<u16, V, std::hash::BuildHasherDefault<PortHasher>>;

/// A hasher for ports.
///
/// Because ports are single `u16` values, we don't have to hash them; we can just use
/// the integer values as hashes directly.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

// === impl PortManager ===

impl<K> Default for PortManager<K> {
    fn default() -> Self {
        Self {
            leases: Mutex::new(Leases {
                by_port: PortMap::default(),
                by_holder: HashMap::default(),
            }),
        }
    }
}

impl<K> PortManager<K>
where
    K: Clone + Eq + Hash + fmt::Display + fmt::Debug,
{
    /// Leases `port` to `holder`, or any free port when `port` is zero.
    ///
    /// Auto-allocation returns the holder's existing lease if it has one. A
    /// successful lease releases any other port previously held by `holder`.
    pub fn lease(&self, holder: &K, port: u16) -> Result<u16, LeaseError<K>> {
        let mut leases = self.leases.lock();

        let port = if port == 0 {
            if let Some(port) = leases.by_holder.get(holder) {
                return Ok(*port);
            }
            leases.free_port()?
        } else {
            match leases.by_port.get(&port) {
                Some(h) if h == holder => return Ok(port),
                Some(h) => {
                    return Err(LeaseError::Conflict {
                        port,
                        holder: h.clone(),
                    })
                }
                None => port,
            }
        };

        leases.release(holder);
        leases.by_port.insert(port, holder.clone());
        leases.by_holder.insert(holder.clone(), port);
        debug!(%holder, port, "Leased port");
        Ok(port)
    }

    /// Releases the port held by `holder`, if any.
    pub fn release(&self, holder: &K) {
        if let Some(port) = self.leases.lock().release(holder) {
            debug!(%holder, port, "Released port");
        }
    }

    #[cfg(test)]
    fn leased(&self) -> usize {
        self.leases.lock().by_port.len()
    }

    #[cfg(test)]
    fn holder(&self, port: u16) -> Option<K> {
        self.leases.lock().by_port.get(&port).cloned()
    }
}

// === impl Leases ===

impl<K: Eq + Hash> Leases<K> {
    fn release(&mut self, holder: &K) -> Option<u16> {
        let port = self.by_holder.remove(holder)?;
        self.by_port.remove(&port);
        Some(port)
    }

    fn free_port<E: fmt::Display + fmt::Debug>(&self) -> Result<u16, LeaseError<E>> {
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ATTEMPTS {
            let port = rng.gen_range(PORT_RANGE);
            if !self.by_port.contains_key(&port) {
                return Ok(port);
            }
        }

        let size = PORT_RANGE.len();
        let offset = rng.gen_range(0..size);
        (0..size)
            .map(|i| PORT_RANGE.start + ((offset + i) % size) as u16)
            .find(|port| !self.by_port.contains_key(port))
            .ok_or(LeaseError::Exhausted)
    }
}

// === impl PortHasher ===

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

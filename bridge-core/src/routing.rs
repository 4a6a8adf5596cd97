//! Destination cluster selection from the preferred network and requested upstream protocol.

use std::sync::atomic::{AtomicU8, Ordering};

use rand::Rng;

use crate::types::{names, HeaderList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Network {
    Generic = 0,
    Wlan = 1,
    Wwan = 2,
}

impl Network {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Network::Wlan,
            2 => Network::Wwan,
            _ => Network::Generic,
        }
    }
}

/// Preferred network, set by the platform from any thread.
#[derive(Debug, Default)]
pub struct PreferredNetwork(AtomicU8);

impl PreferredNetwork {
    pub fn set(&self, network: Network) {
        self.0.store(network as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> Network {
        Network::from_u8(self.0.load(Ordering::Relaxed))
    }
}

/// Source of the coin flip between primary and alternate clusters.
pub trait Random {
    fn random(&mut self) -> u64;
}

/// Thread-local `rand` generator.
#[derive(Debug, Default)]
pub struct ThreadRandom;

impl Random for ThreadRandom {
    fn random(&mut self) -> u64 {
        rand::thread_rng().gen()
    }
}

/// Consume the upstream protocol header and write the cluster header.
///
/// `http2` always selects the h2 cluster; `alpn` selects it when `alternate` is set; anything
/// else (or absent) selects the base cluster.
pub fn set_destination_cluster(headers: &mut HeaderList, network: Network, alternate: bool) {
    let protocol = headers.remove(names::UPSTREAM_PROTOCOL);
    let h2 = match protocol.as_deref().map(str::trim) {
        Some(p) if p.eq_ignore_ascii_case("http2") => true,
        Some(p) if p.eq_ignore_ascii_case("alpn") => alternate,
        _ => false,
    };
    let base = match network {
        Network::Generic => "base",
        Network::Wlan => "base_wlan",
        Network::Wwan => "base_wwan",
    };
    let cluster = if h2 {
        format!("{base}_h2")
    } else {
        base.to_string()
    };
    headers.set(names::CLUSTER, cluster);
}

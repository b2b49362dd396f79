use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, TcpListener};

use rand::Rng;

use crate::error::{CoreError, CoreResult};

pub const EPHEMERAL_MIN: u16 = 1024;
pub const EPHEMERAL_MAX: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Available,
    Busy,
}

/// Binds `127.0.0.1:port` and releases it right away.
///
/// `AddrInUse` maps to [`PortStatus::Busy`]; any other bind failure is returned as an error.
pub fn is_port_free(port: u16) -> io::Result<PortStatus> {
    if port == 0 {
        return Err(io::Error::new(ErrorKind::InvalidInput, "port 0 cannot be probed"));
    }
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(listener) => {
            drop(listener);
            Ok(PortStatus::Available)
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(PortStatus::Busy),
        Err(e) => Err(e),
    }
}

/// Draws random ports in `[1024, 65535]` until one probes free, at most `attempts` times.
pub fn pick_ephemeral_port(attempts: u32, exclude: &[u16]) -> CoreResult<u16> {
    let mut rng = rand::thread_rng();
    for attempt in 1..=attempts {
        let port = rng.gen_range(EPHEMERAL_MIN..=EPHEMERAL_MAX);
        if exclude.contains(&port) {
            log::info!("[PORT] Attempt {}: port {} is reserved, drawing again", attempt, port);
            continue;
        }
        match is_port_free(port) {
            Ok(PortStatus::Available) => {
                log::info!("[PORT] Port {} is available", port);
                return Ok(port);
            }
            Ok(PortStatus::Busy) => {
                log::info!("[PORT] Attempt {}: port {} is already in use", attempt, port);
            }
            Err(e) => {
                log::warn!("[PORT] Attempt {}: probing port {} failed: {}", attempt, port, e);
            }
        }
    }
    log::error!("[PORT] No free port found after {} attempts", attempts);
    Err(CoreError::PortUnavailable { attempts })
}

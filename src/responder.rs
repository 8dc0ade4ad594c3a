//! Datagram responder serving cached sensor values.
//!
//! Protocol: the first byte of a request is an ASCII digit naming a sensor
//! ordinal (`'0'..'3'`). The reply is always [`UDP_RESPONSE_LEN`] bytes:
//! `sensor_value=<u16>\n` followed by zero padding. Unknown or empty
//! requests are logged and answered with value 0.
//!
//! [`serve_window`] runs for a bounded period and is written against the
//! [`DatagramSocket`] and [`Clock`] seams so it runs on the embassy-net stack
//! on target and against scripted mocks in tests.

use core::fmt::Write;

use heapless::String;

use crate::cache::SensorCache;
use crate::config::{UDP_MAX_SOCKET_FAILURES, UDP_RESPONSE_LEN};
use crate::error::{Error, Result};
use crate::sensor::SensorKind;

/// Receive buffer; only the first byte of a request matters.
const RX_BUF_LEN: usize = 32;

pub type Response = [u8; UDP_RESPONSE_LEN];

pub fn parse_request(datagram: &[u8]) -> Result<SensorKind> {
    let first = *datagram.first().ok_or(Error::EmptyRequest)?;
    SensorKind::from_ascii(first)
}

pub fn encode_response(value: u16) -> Result<Response> {
    let mut text: String<UDP_RESPONSE_LEN> = String::new();
    writeln!(text, "sensor_value={}", value).map_err(|_| Error::BufferOverflow)?;
    let mut out = [0u8; UDP_RESPONSE_LEN];
    out[..text.len()].copy_from_slice(text.as_bytes());
    Ok(out)
}

/// Answer one request from the cache.
pub fn respond(cache: &SensorCache, datagram: &[u8]) -> Response {
    let value = match parse_request(datagram) {
        Ok(kind) => cache.get(kind),
        Err(e) => {
            error!("bad request: {:?}", e);
            0
        }
    };
    encode_response(value).unwrap_or([0; UDP_RESPONSE_LEN])
}

/// Why a receive returned without a datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvError<E> {
    /// Nothing arrived within the per-receive timeout.
    TimedOut,
    Other(E),
}

/// A bound datagram socket with a per-receive timeout.
#[allow(async_fn_in_trait)]
pub trait DatagramSocket {
    type Endpoint: Copy;
    type Error;

    async fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> core::result::Result<(usize, Self::Endpoint), RecvError<Self::Error>>;

    async fn send_to(
        &mut self,
        buf: &[u8],
        to: Self::Endpoint,
    ) -> core::result::Result<(), Self::Error>;
}

/// Monotonic milliseconds.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Counters for one serving window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WindowStats {
    pub served: u32,
    pub rejected: u32,
    pub timeouts: u32,
}

/// Answer requests until `period_ms` has elapsed.
///
/// Receive timeouts only give the loop a chance to check the clock.
/// [`UDP_MAX_SOCKET_FAILURES`] consecutive receive errors, or as many
/// consecutive send errors, end the window early with [`Error::Socket`].
pub async fn serve_window<S, C>(
    socket: &mut S,
    clock: &C,
    cache: &SensorCache,
    period_ms: u32,
) -> Result<WindowStats>
where
    S: DatagramSocket,
    C: Clock,
{
    let start = clock.now_ms();
    let budget = u64::from(period_ms);
    let mut stats = WindowStats::default();
    let mut recv_failures: u8 = 0;
    let mut send_failures: u8 = 0;
    let mut rx = [0u8; RX_BUF_LEN];

    debug!("serving requests for {} ms", period_ms);
    while clock.now_ms().saturating_sub(start) <= budget {
        let (len, peer) = match socket.recv_from(&mut rx).await {
            Ok(received) => {
                recv_failures = 0;
                received
            }
            Err(RecvError::TimedOut) => {
                stats.timeouts += 1;
                continue;
            }
            Err(RecvError::Other(_)) => {
                recv_failures += 1;
                error!("recv failed ({}/{})", recv_failures, UDP_MAX_SOCKET_FAILURES);
                if recv_failures >= UDP_MAX_SOCKET_FAILURES {
                    return Err(Error::Socket);
                }
                continue;
            }
        };

        let request = &rx[..len];
        if parse_request(request).is_ok() {
            stats.served += 1;
        } else {
            stats.rejected += 1;
        }
        let response = respond(cache, request);

        if socket.send_to(&response, peer).await.is_err() {
            send_failures += 1;
            error!("send failed ({}/{})", send_failures, UDP_MAX_SOCKET_FAILURES);
            if send_failures >= UDP_MAX_SOCKET_FAILURES {
                return Err(Error::Socket);
            }
        } else {
            send_failures = 0;
        }
    }
    info!(
        "serving window closed: {} served, {} rejected",
        stats.served, stats.rejected
    );
    Ok(stats)
}

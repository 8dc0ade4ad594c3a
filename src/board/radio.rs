//! SoftDevice radio adapter.
//!
//! The orchestrator is a pure state machine; this module is its only
//! caller. Commands run one at a time on the SoftDevice central API and
//! each completion is queued as a [`RadioEvent`] for the next `step`.
//!
//! The SoftDevice has no notion of registered GATT applications, so
//! registration is answered locally: interface `n` is profile `n`.

use defmt::{debug, error, info, warn};
use embassy_time::{with_timeout, Duration, Timer};
use heapless::Deque;
use nrf_softdevice::ble::gatt_client::{self, DiscoverError};
use nrf_softdevice::ble::{central, AddressType, Connection};
use nrf_softdevice::Softdevice;

use sensor_hub::ble::handler::{ProfileHandler, ScanFallback};
use sensor_hub::ble::orchestrator::Orchestrator;
use sensor_hub::ble::{
    AddrKind, Address, AdvData, Command, ConnId, DisconnectReason, GattIf, GattStatus,
    RadioEvent, ReadValue, ScanParams, Uuid16,
};
use sensor_hub::config::{
    BLE_CONNECT_TIMEOUT_SECS, BLE_SCAN_RETRY_MS, MAX_PROFILES, SENSOR_CHAR_UUID,
    SENSOR_SERVICE_UUID,
};
use sensor_hub::Error;

use crate::board::net;

/// Generic failure code reported for SoftDevice errors (`GATT_ERROR`).
const STATUS_ERROR: GattStatus = GattStatus::Failed(0x85);

/// The wrapper does not surface the HCI reason of an unexpected drop.
const UNKNOWN_REASON: DisconnectReason = DisconnectReason::Other(0);

/// GATT client for the sensor service.
#[nrf_softdevice::gatt_client(uuid = "00ff")]
pub struct SensorClient {
    /// Little-endian sensor reading.
    #[characteristic(uuid = "ff01", read)]
    pub sensor_value: ReadValue,
}

struct Link {
    conn_id: ConnId,
    conn: Connection,
    client: Option<SensorClient>,
}

pub struct Radio {
    sd: &'static Softdevice,
    scan: ScanParams,
    links: [Option<Link>; MAX_PROFILES],
    next_conn: u16,
    events: Deque<RadioEvent, 16>,
}

impl Radio {
    pub fn new(sd: &'static Softdevice) -> Self {
        Self {
            sd,
            scan: ScanParams::DEFAULT,
            links: core::array::from_fn(|_| None),
            next_conn: 0,
            events: Deque::new(),
        }
    }

    /// Drive `orch` until it reports a fatal error.
    pub async fn run<H, F>(&mut self, orch: &mut Orchestrator<H, F>) -> Error
    where
        H: ProfileHandler,
        F: ScanFallback,
    {
        let mut pending: Deque<Command, 32> = Deque::new();
        enqueue_all(&mut pending, orch.start());

        loop {
            while let Some(cmd) = pending.pop_front() {
                if let Err(e) = self.execute(cmd, orch, &mut pending).await {
                    return e;
                }
            }

            let Some(event) = self.events.pop_front() else {
                warn!("nothing in flight in state {}", orch.state());
                Timer::after_millis(u64::from(BLE_SCAN_RETRY_MS)).await;
                continue;
            };

            match orch.step(event) {
                Ok(commands) => enqueue_all(&mut pending, commands),
                Err(e) => return e,
            }
        }
    }

    async fn execute<H, F>(
        &mut self,
        cmd: Command,
        orch: &mut Orchestrator<H, F>,
        pending: &mut Deque<Command, 32>,
    ) -> Result<(), Error>
    where
        H: ProfileHandler,
        F: ScanFallback,
    {
        debug!("radio: {}", cmd);
        match cmd {
            Command::SetScanParams(params) => self.scan = params,
            Command::RegisterApp { app_id } => self.push(RadioEvent::Registered {
                app_id,
                gatt_if: GattIf(app_id as u8),
                status: GattStatus::Success,
            }),
            Command::StartScan { duration_secs } => {
                self.run_scan(duration_secs, orch, pending).await?
            }
            // Scans stop from inside the report callback; see `run_scan`.
            Command::StopScan => {}
            Command::Open { gatt_if, address } => self.open(gatt_if, address).await,
            Command::ConfigureMtu { gatt_if, mtu, .. } => {
                // The SoftDevice runs the exchange itself, up to the
                // `conn_gatt.att_mtu` it was enabled with.
                self.push(RadioEvent::MtuConfigured {
                    gatt_if,
                    status: GattStatus::Success,
                    mtu,
                });
            }
            Command::SearchService { gatt_if, uuid, .. } => {
                self.search_service(gatt_if, uuid).await
            }
            Command::ResolveCharacteristic { gatt_if, uuid, .. } => {
                self.resolve_characteristic(gatt_if, uuid)
            }
            Command::ReadCharacteristic { gatt_if, handle, .. } => {
                self.read(gatt_if, handle).await
            }
            Command::Close { gatt_if, .. } => self.close(gatt_if),
            Command::Pause { ms } => Timer::after_millis(u64::from(ms)).await,
            Command::ServeRequests { period_ms } => match net::serve(period_ms).await {
                Ok(stats) => info!("served {} requests", stats.served),
                Err(e) => warn!("serving window failed: {}", e),
            },
        }
        Ok(())
    }

    /// Scan for `duration_secs`, stepping the orchestrator on every report.
    async fn run_scan<H, F>(
        &mut self,
        duration_secs: u32,
        orch: &mut Orchestrator<H, F>,
        pending: &mut Deque<Command, 32>,
    ) -> Result<(), Error>
    where
        H: ProfileHandler,
        F: ScanFallback,
    {
        let config = central::ScanConfig {
            active: self.scan.active,
            interval: u32::from(self.scan.interval),
            window: u32::from(self.scan.window),
            ..Default::default()
        };

        let mut stopped = false;
        let mut fatal = None;
        let scan = central::scan(self.sd, &config, |params| {
            let data = unsafe {
                core::slice::from_raw_parts(params.data.p_data, params.data.len as usize)
            };
            let mut adv = AdvData::new();
            if adv.extend_from_slice(data).is_err() {
                return None;
            }
            let peer = nrf_softdevice::ble::Address::from_raw(params.peer_addr);
            let address = Address::new(addr_kind(peer.address_type()), peer.bytes());

            match orch.step(RadioEvent::ScanReport { address, adv }) {
                Ok(commands) => {
                    for cmd in commands {
                        if cmd == Command::StopScan {
                            stopped = true;
                        } else {
                            enqueue(pending, cmd);
                        }
                    }
                }
                Err(e) => fatal = Some(e),
            }

            // Return None to keep scanning, Some(()) to stop.
            (stopped || fatal.is_some()).then_some(())
        });

        let outcome =
            with_timeout(Duration::from_secs(u64::from(duration_secs)), scan).await;

        if let Some(e) = fatal {
            return Err(e);
        }
        match outcome {
            Ok(Ok(())) if stopped => self.push(RadioEvent::ScanStopped),
            Ok(Ok(())) | Err(_) => self.push(RadioEvent::ScanComplete),
            Ok(Err(_)) => {
                warn!("BLE scan refused");
                self.push(RadioEvent::CommandFailed(Command::StartScan { duration_secs }));
            }
        }
        Ok(())
    }

    async fn open(&mut self, gatt_if: GattIf, address: Address) {
        let peer = nrf_softdevice::ble::Address::new(address_type(address.kind), address.bytes);
        let whitelist = [&peer];
        let config = central::ConnectConfig {
            scan_config: central::ScanConfig {
                whitelist: Some(&whitelist),
                ..Default::default()
            },
            ..Default::default()
        };

        let timeout = Duration::from_secs(u64::from(BLE_CONNECT_TIMEOUT_SECS));
        let conn = match with_timeout(timeout, central::connect(self.sd, &config)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(_)) | Err(_) => {
                warn!("connect to {} failed", address.bytes);
                self.push(RadioEvent::Opened {
                    gatt_if,
                    status: STATUS_ERROR,
                    conn_id: ConnId(0),
                });
                return;
            }
        };

        let conn_id = ConnId(self.next_conn);
        self.next_conn = self.next_conn.wrapping_add(1);
        if let Some(slot) = self.links.get_mut(usize::from(gatt_if.0)) {
            *slot = Some(Link {
                conn_id,
                conn,
                client: None,
            });
        }
        self.push(RadioEvent::Opened {
            gatt_if,
            status: GattStatus::Success,
            conn_id,
        });
    }

    async fn search_service(&mut self, gatt_if: GattIf, uuid: Uuid16) {
        let Some(link) = self.link_mut(gatt_if) else {
            self.push(RadioEvent::ServiceSearchComplete {
                gatt_if,
                status: STATUS_ERROR,
            });
            return;
        };
        let conn_id = link.conn_id;

        let status = if uuid != SENSOR_SERVICE_UUID {
            GattStatus::Success
        } else {
            match gatt_client::discover::<SensorClient>(&link.conn).await {
                Ok(client) => {
                    let handle = client.sensor_value_value_handle;
                    link.client = Some(client);
                    // Discovery already resolved the range; report the
                    // declaration and value handles.
                    self.push(RadioEvent::ServiceFound {
                        gatt_if,
                        uuid,
                        start_handle: handle.saturating_sub(1),
                        end_handle: handle,
                    });
                    GattStatus::Success
                }
                Err(DiscoverError::ServiceNotFound) => GattStatus::Success,
                Err(_) => STATUS_ERROR,
            }
        };

        self.push(RadioEvent::ServiceSearchComplete { gatt_if, status });
        if !status.is_ok() {
            self.check_link(gatt_if, conn_id);
        }
    }

    fn resolve_characteristic(&mut self, gatt_if: GattIf, uuid: Uuid16) {
        let handle = self
            .link_mut(gatt_if)
            .and_then(|link| link.client.as_ref())
            .filter(|_| uuid == SENSOR_CHAR_UUID)
            .map(|client| client.sensor_value_value_handle);

        let (matches, handle) = match handle {
            Some(handle) => (1, handle),
            None => (0, 0),
        };
        self.push(RadioEvent::CharacteristicsResolved {
            gatt_if,
            status: GattStatus::Success,
            total: matches,
            matches,
            handle,
        });
    }

    async fn read(&mut self, gatt_if: GattIf, handle: u16) {
        let Some(link) = self.link_mut(gatt_if) else {
            self.push(RadioEvent::ReadComplete {
                gatt_if,
                status: STATUS_ERROR,
                value: ReadValue::new(),
            });
            return;
        };
        let conn_id = link.conn_id;

        let mut buf = [0u8; sensor_hub::config::BLE_READ_MAX_LEN];
        let (status, value) = match gatt_client::read(&link.conn, handle, &mut buf).await {
            Ok(len) => {
                let mut value = ReadValue::new();
                // `buf` bounds `len`, and `value` has the same capacity.
                let _ = value.extend_from_slice(&buf[..len.min(buf.len())]);
                (GattStatus::Success, value)
            }
            Err(_) => (STATUS_ERROR, ReadValue::new()),
        };

        self.push(RadioEvent::ReadComplete {
            gatt_if,
            status,
            value,
        });
        if !status.is_ok() {
            self.check_link(gatt_if, conn_id);
        }
    }

    fn close(&mut self, gatt_if: GattIf) {
        let link = self
            .links
            .get_mut(usize::from(gatt_if.0))
            .and_then(Option::take);
        if let Some(link) = link {
            if link.conn.disconnect().is_ok() {
                self.push(RadioEvent::Disconnected {
                    gatt_if,
                    reason: DisconnectReason::LocalHostTerminated,
                });
            }
        }
        self.push(RadioEvent::Closed { gatt_if });
    }

    /// Report a link that dropped under a failed procedure.
    fn check_link(&mut self, gatt_if: GattIf, conn_id: ConnId) {
        let dropped = self
            .link_mut(gatt_if)
            .is_some_and(|link| link.conn_id == conn_id && link.conn.handle().is_none());
        if !dropped {
            return;
        }
        warn!("link {} dropped", conn_id.0);
        if let Some(slot) = self.links.get_mut(usize::from(gatt_if.0)) {
            *slot = None;
        }
        self.push(RadioEvent::Disconnected {
            gatt_if,
            reason: UNKNOWN_REASON,
        });
    }

    fn link_mut(&mut self, gatt_if: GattIf) -> Option<&mut Link> {
        self.links
            .get_mut(usize::from(gatt_if.0))
            .and_then(Option::as_mut)
    }

    fn push(&mut self, event: RadioEvent) {
        if self.events.push_back(event).is_err() {
            error!("radio event queue full, dropping event");
        }
    }
}

fn enqueue(pending: &mut Deque<Command, 32>, cmd: Command) {
    if pending.push_back(cmd).is_err() {
        error!("radio command queue full, dropping command");
    }
}

fn enqueue_all(pending: &mut Deque<Command, 32>, commands: impl IntoIterator<Item = Command>) {
    for cmd in commands {
        enqueue(pending, cmd);
    }
}

fn addr_kind(kind: AddressType) -> AddrKind {
    match kind {
        AddressType::Public => AddrKind::Public,
        _ => AddrKind::Random,
    }
}

fn address_type(kind: AddrKind) -> AddressType {
    match kind {
        AddrKind::Public => AddressType::Public,
        AddrKind::Random => AddressType::RandomStatic,
    }
}

//! BLE sensor hub - nRF52840 firmware entry point.
//!
//! Tasks:
//! - `softdevice_task` - SoftDevice event pump.
//! - `ble_task`        - orchestrator + sensor poller on the radio.
//! - `usb_task`, `ncm_task`, `net_task` - USB Ethernet link and IP stack.
//! - `responder_task`  - UDP responder, woken once per polling round.

#![no_std]
#![no_main]

mod board;

use defmt::{error, info, unwrap};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_nrf::interrupt::{self, InterruptExt, Priority};
use embassy_net::Stack;
use embassy_usb::class::cdc_ncm::embassy_net::{Device, Runner};
use embassy_usb::UsbDevice;
use nrf_softdevice::{raw, Softdevice};
use panic_probe as _;

use sensor_hub::ble::orchestrator::{Orchestrator, OrchestratorConfig};
use sensor_hub::ble::registry::RemoteId;
use sensor_hub::ble::roster::Roster;
use sensor_hub::cache::SensorCache;
use sensor_hub::config::{
    BLE_ATT_MTU, SENSOR_CHAR_UUID, SENSOR_ROSTER, SENSOR_SERVICE_UUID, UDP_SERVE_PERIOD_MS,
};
use sensor_hub::poller::{SensorPoller, ServeWhenIdle};

use board::net::{self, UsbDriver, MTU};
use board::radio::Radio;

static CACHE: SensorCache = SensorCache::new();

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn ble_task(sd: &'static Softdevice) {
    let mut roster = Roster::new();
    let mut poller = SensorPoller::new(&CACHE, UDP_SERVE_PERIOD_MS);
    for (name, kind) in SENSOR_ROSTER {
        let id = match roster.add(name, SENSOR_SERVICE_UUID, SENSOR_CHAR_UUID) {
            Ok(id) => id,
            Err(e) => {
                error!("roster entry {} rejected: {}", name, e);
                return;
            }
        };
        if let Err(e) = poller.add(RemoteId(id), kind) {
            error!("sensor for {} rejected: {}", name, e);
            return;
        }
    }

    let mut orchestrator = Orchestrator::new(roster, poller, OrchestratorConfig::DEFAULT)
        .with_fallback(ServeWhenIdle {
            period_ms: UDP_SERVE_PERIOD_MS,
        });

    info!("BLE task started ({} sensors)", SENSOR_ROSTER.len());
    let err = Radio::new(sd).run(&mut orchestrator).await;
    error!("orchestrator halted: {}", err);
}

#[embassy_executor::task]
async fn usb_task(device: UsbDevice<'static, UsbDriver>) -> ! {
    net::run_usb_device(device).await
}

#[embassy_executor::task]
async fn ncm_task(ncm: Runner<'static, UsbDriver, MTU>) -> ! {
    net::run_ncm(ncm).await
}

#[embassy_executor::task]
async fn net_task(runner: embassy_net::Runner<'static, Device<'static, MTU>>) -> ! {
    net::run_stack(runner).await
}

#[embassy_executor::task]
async fn responder_task(stack: Stack<'static>) -> ! {
    net::responder_task(stack, &CACHE).await
}

fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t {
            att_mtu: BLE_ATT_MTU,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 0,
            periph_role_count: 0,
            central_role_count: 1,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        ..Default::default()
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("ble-sensor-hub starting");

    // Priorities 0, 1 and 4 are reserved by the SoftDevice.
    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(config);
    interrupt::USBD.set_priority(Priority::P2);

    let sd: &'static Softdevice = Softdevice::enable(&softdevice_config());

    let mut seed = [0u8; 8];
    if nrf_softdevice::random_bytes(sd, &mut seed).is_err() {
        error!("no entropy from the SoftDevice, using a fixed seed");
    }

    let link = net::init(p.USBD, u64::from_le_bytes(seed));

    unwrap!(spawner.spawn(softdevice_task(sd)));
    unwrap!(spawner.spawn(usb_task(link.device)));
    unwrap!(spawner.spawn(ncm_task(link.ncm)));
    unwrap!(spawner.spawn(net_task(link.net)));
    unwrap!(spawner.spawn(responder_task(link.stack)));
    unwrap!(spawner.spawn(ble_task(sd)));
}

//! USB Ethernet link and the UDP responder task.
//!
//! The hub enumerates as a CDC-NCM adapter; the host sees a point-to-point
//! Ethernet link with the hub at [`NET_IPV4_ADDR`]. The responder only runs
//! while the BLE task has handed it a serving window.

use defmt::{info, warn};
use embassy_net::udp::{self, PacketMetadata, UdpMetadata, UdpSocket};
use embassy_net::{Ipv4Address, Ipv4Cidr, Stack, StackResources, StaticConfigV4};
use embassy_nrf::usb::vbus_detect::SoftwareVbusDetect;
use embassy_nrf::usb::Driver;
use embassy_nrf::{bind_interrupts, peripherals};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Instant};
use embassy_usb::class::cdc_ncm::embassy_net::{Device, Runner, State as NetState};
use embassy_usb::class::cdc_ncm::{CdcNcmClass, State};
use embassy_usb::{Builder, Config, UsbDevice};
use static_cell::StaticCell;

use sensor_hub::cache::SensorCache;
use sensor_hub::config::{
    NET_DEVICE_MAC, NET_HOST_MAC, NET_IPV4_ADDR, NET_IPV4_PREFIX, UDP_RECV_TIMEOUT_MS,
    UDP_SERVER_PORT, USB_MANUFACTURER, USB_PID, USB_PRODUCT, USB_SERIAL_NUMBER, USB_VID,
};
use sensor_hub::responder::{self, Clock, DatagramSocket, RecvError, WindowStats};
use sensor_hub::{Error, Result};

/// Ethernet frame size handed to embassy-net.
pub const MTU: usize = 1514;

pub type UsbDriver = Driver<'static, peripherals::USBD, &'static SoftwareVbusDetect>;

bind_interrupts!(struct Irqs {
    USBD => embassy_nrf::usb::InterruptHandler<peripherals::USBD>;
});

static VBUS: StaticCell<SoftwareVbusDetect> = StaticCell::new();
static USB_CONFIG_DESC: StaticCell<[u8; 256]> = StaticCell::new();
static USB_BOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
static USB_CTRL_BUF: StaticCell<[u8; 128]> = StaticCell::new();
static NCM_STATE: StaticCell<State> = StaticCell::new();
static NET_STATE: StaticCell<NetState<MTU, 4, 4>> = StaticCell::new();
static RESOURCES: StaticCell<StackResources<2>> = StaticCell::new();

static SERVE_REQUEST: Signal<CriticalSectionRawMutex, u32> = Signal::new();
static SERVE_DONE: Signal<CriticalSectionRawMutex, Result<WindowStats>> = Signal::new();

/// Everything the tasks in `main` need to run the link.
pub struct UsbNet {
    pub device: UsbDevice<'static, UsbDriver>,
    pub ncm: Runner<'static, UsbDriver, MTU>,
    pub stack: Stack<'static>,
    pub net: embassy_net::Runner<'static, Device<'static, MTU>>,
}

/// Initialise the USB stack, the CDC-NCM class and the IP stack.
///
/// Must be called exactly once.
pub fn init(usbd: peripherals::USBD, seed: u64) -> UsbNet {
    // The SoftDevice owns POWER. The hub is bus powered, so VBUS is
    // present for as long as it runs.
    let vbus = VBUS.init(SoftwareVbusDetect::new(true, true));
    let driver = Driver::new(usbd, Irqs, &*vbus);

    let mut usb_config = Config::new(USB_VID, USB_PID);
    usb_config.manufacturer = Some(USB_MANUFACTURER);
    usb_config.product = Some(USB_PRODUCT);
    usb_config.serial_number = Some(USB_SERIAL_NUMBER);
    usb_config.max_power = 100; // mA
    usb_config.max_packet_size_0 = 64;

    let mut builder = Builder::new(
        driver,
        usb_config,
        USB_CONFIG_DESC.init([0u8; 256]),
        USB_BOS_DESC.init([0u8; 256]),
        &mut [], // no msos descriptors
        USB_CTRL_BUF.init([0u8; 128]),
    );

    let class = CdcNcmClass::new(&mut builder, NCM_STATE.init(State::new()), NET_HOST_MAC, 64);
    let device = builder.build();
    let (ncm, net_device) =
        class.into_embassy_net_device::<MTU, 4, 4>(NET_STATE.init(NetState::new()), NET_DEVICE_MAC);

    let [a, b, c, d] = NET_IPV4_ADDR;
    let config = embassy_net::Config::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(Ipv4Address::new(a, b, c, d), NET_IPV4_PREFIX),
        gateway: None,
        dns_servers: Default::default(),
    });
    let (stack, net) = embassy_net::new(
        net_device,
        config,
        RESOURCES.init(StackResources::new()),
        seed,
    );

    info!("USB network initialised ({}.{}.{}.{})", a, b, c, d);

    UsbNet {
        device,
        ncm,
        stack,
        net,
    }
}

/// Hand a serving window to the responder task and wait for it to close.
pub async fn serve(period_ms: u32) -> Result<WindowStats> {
    SERVE_DONE.reset();
    SERVE_REQUEST.signal(period_ms);
    SERVE_DONE.wait().await
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum SocketError {
    Recv(udp::RecvError),
    Send(udp::SendError),
}

/// The bound responder socket with the per-receive timeout applied.
struct TimedSocket<'a> {
    inner: UdpSocket<'a>,
}

impl DatagramSocket for TimedSocket<'_> {
    type Endpoint = UdpMetadata;
    type Error = SocketError;

    async fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> core::result::Result<(usize, UdpMetadata), RecvError<SocketError>> {
        let timeout = Duration::from_millis(u64::from(UDP_RECV_TIMEOUT_MS));
        match with_timeout(timeout, self.inner.recv_from(buf)).await {
            Ok(Ok(received)) => Ok(received),
            Ok(Err(e)) => Err(RecvError::Other(SocketError::Recv(e))),
            Err(_) => Err(RecvError::TimedOut),
        }
    }

    async fn send_to(
        &mut self,
        buf: &[u8],
        to: UdpMetadata,
    ) -> core::result::Result<(), SocketError> {
        self.inner.send_to(buf, to).await.map_err(SocketError::Send)
    }
}

struct Uptime;

impl Clock for Uptime {
    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

/// Responder loop - sleeps until the BLE task asks for a serving window.
pub async fn responder_task(stack: Stack<'static>, cache: &'static SensorCache) -> ! {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0u8; 256];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_buffer = [0u8; 256];

    let mut socket = TimedSocket {
        inner: UdpSocket::new(
            stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        ),
    };

    info!("responder task started");

    loop {
        let period_ms = SERVE_REQUEST.wait().await;

        if !socket.inner.is_open() {
            if let Err(e) = socket.inner.bind(UDP_SERVER_PORT) {
                warn!("bind to port {} failed: {}", UDP_SERVER_PORT, e);
                SERVE_DONE.signal(Err(Error::Socket));
                continue;
            }
            info!("listening on udp/{}", UDP_SERVER_PORT);
        }

        let result = responder::serve_window(&mut socket, &Uptime, cache, period_ms).await;
        if result.is_err() {
            // Rebind on the next window.
            socket.inner.close();
        }
        SERVE_DONE.signal(result);
    }
}

/// Run the USB device stack - must be spawned as a dedicated Embassy task.
pub async fn run_usb_device(mut device: UsbDevice<'static, UsbDriver>) -> ! {
    info!("USB device task started");
    device.run().await
}

pub async fn run_ncm(ncm: Runner<'static, UsbDriver, MTU>) -> ! {
    ncm.run().await
}

pub async fn run_stack(mut net: embassy_net::Runner<'static, Device<'static, MTU>>) -> ! {
    net.run().await
}

//! UCI driver: the high-level device API.
//!
//! Each command is encoded, written under the bus lock, and then either
//! answered by a synchronous read or by a notification captured by the
//! listener thread. No retries happen at this layer.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::bus::{BusError, BusLink};
use crate::config::DriverConfig;
use crate::dispatch::Dispatcher;
use crate::events::{ObserverThread, PacketDirection, TracingObserver, UciEvent, UciObserver};
use crate::firmware::{FirmwareError, FirmwareLoader, FirmwareSource, LoadReport};
use crate::listener::Listener;
use crate::protocol::constants::COUNT_RESPONSE_LEN;
use crate::protocol::{CodecError, Command, Notification, NotificationCode, decode_count};
use crate::state::UwbsState;

#[derive(Error, Debug)]
pub enum UciError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("No {code} notification within {timeout_ms} ms")]
    NotificationTimeout {
        code: NotificationCode,
        timeout_ms: u64,
    },

    #[error("Command cannot be encoded: {0}")]
    InvalidCommand(#[source] CodecError),

    #[error("Malformed response: {0}")]
    Response(#[source] CodecError),

    #[error("Firmware load failed: {0}")]
    Firmware(#[from] FirmwareError),

    #[error("Failed to start driver thread: {0}")]
    Listener(#[source] io::Error),
}

/// Hardware handed to the driver at construction.
pub struct HardwareParts<SPI, CS, CE, IRQ, D> {
    pub spi: SPI,
    /// Chip-select output (active-low).
    pub cs: CS,
    /// Chip-enable output (active-high).
    pub ce: CE,
    /// Interrupt input.
    pub irq: IRQ,
    pub delay: D,
}

pub struct UciDriver<SPI, CS, CE, D> {
    // Dropped first: stops and joins the listener before the link goes away.
    listener: Listener,
    link: Arc<BusLink<SPI, CS, CE, D>>,
    dispatcher: Arc<Dispatcher>,
    config: DriverConfig,
    observer: Arc<dyn UciObserver>,
    // Dropped last, once the listener can no longer raise events.
    _events: ObserverThread,
}

impl<SPI, CS, CE, D> UciDriver<SPI, CS, CE, D>
where
    SPI: SpiBus<u8> + Send + 'static,
    CS: OutputPin + Send + 'static,
    CE: OutputPin + Send + 'static,
    D: DelayNs + Send + 'static,
{
    /// Take ownership of the hardware and start the interrupt listener.
    /// Events are logged through `tracing`.
    pub fn new<IRQ>(
        parts: HardwareParts<SPI, CS, CE, IRQ, D>,
        config: DriverConfig,
    ) -> Result<Self, UciError>
    where
        IRQ: InputPin + Send + 'static,
    {
        Self::with_observer(parts, config, Arc::new(TracingObserver))
    }

    pub fn with_observer<IRQ>(
        parts: HardwareParts<SPI, CS, CE, IRQ, D>,
        config: DriverConfig,
        observer: Arc<dyn UciObserver>,
    ) -> Result<Self, UciError>
    where
        IRQ: InputPin + Send + 'static,
    {
        let HardwareParts {
            spi,
            cs,
            ce,
            irq,
            delay,
        } = parts;

        let link = Arc::new(BusLink::new(spi, cs, ce, delay, config.link.clone())?);
        let (events, forwarder) =
            ObserverThread::spawn(observer.clone()).map_err(UciError::Listener)?;
        let dispatcher = Arc::new(Dispatcher::with_observer(
            config.dispatch.queue_capacity,
            forwarder,
        ));
        let listener = Listener::spawn(link.clone(), irq, dispatcher.clone(), &config.dispatch)
            .map_err(UciError::Listener)?;

        info!(
            frame_len = config.dispatch.frame_len,
            queue_capacity = config.dispatch.queue_capacity,
            "UCI driver ready"
        );

        Ok(Self {
            listener,
            link,
            dispatcher,
            config,
            observer,
            _events: events,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn link(&self) -> &BusLink<SPI, CS, CE, D> {
        &self.link
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_running()
    }

    /// Current UWBS state.
    pub fn state(&self) -> UwbsState {
        self.dispatcher.state()
    }

    /// Assert chip-enable and wait for the chip to stabilize.
    pub fn power_on(&self) -> Result<(), UciError> {
        Ok(self.link.assert_enable()?)
    }

    pub fn power_off(&self) -> Result<(), UciError> {
        Ok(self.link.deassert_enable()?)
    }

    /// Pulse the enable line. Does not wait for any notification.
    pub fn hard_reset(&self) -> Result<(), UciError> {
        Ok(self.link.reset_device()?)
    }

    fn send(&self, command: &Command) -> Result<(), UciError> {
        let bytes = command.to_bytes();
        debug!(opcode = %command.opcode(), len = bytes.len(), "Sending command");
        self.observer.on_event(&UciEvent::Packet {
            direction: PacketDirection::Tx,
            length: bytes.len(),
            data: bytes.clone(),
        });
        self.link.transmit(&bytes)?;
        Ok(())
    }

    fn read_response(&self, len: usize) -> Result<Vec<u8>, UciError> {
        let bytes = self.link.read(len)?;
        self.observer.on_event(&UciEvent::Packet {
            direction: PacketDirection::Rx,
            length: bytes.len(),
            data: bytes.clone(),
        });
        Ok(bytes)
    }

    fn await_notification(
        &self,
        code: NotificationCode,
        timeout: Duration,
    ) -> Result<Notification, UciError> {
        self.dispatcher
            .wait_for(code, timeout)
            .ok_or(UciError::NotificationTimeout {
                code,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }

    fn command_with_notification(
        &self,
        command: &Command,
        code: NotificationCode,
    ) -> Result<Notification, UciError> {
        self.send(command)?;
        self.await_notification(code, self.config.dispatch.notification_timeout())
    }

    /// Device-Reset; returns the Device-Status notification.
    #[instrument(skip(self))]
    pub fn reset_device(&self) -> Result<Notification, UciError> {
        let ntf =
            self.command_with_notification(&Command::device_reset(), NotificationCode::DeviceStatus)?;
        info!(status = ?ntf, "Device reset");
        Ok(ntf)
    }

    /// Get-Device-Info; returns the Device-Info notification.
    #[instrument(skip(self))]
    pub fn get_device_info(&self) -> Result<Notification, UciError> {
        self.command_with_notification(&Command::get_device_info(), NotificationCode::DeviceInfo)
    }

    /// Get-Caps-Info; the capabilities are read back synchronously.
    #[instrument(skip(self))]
    pub fn get_caps_info(&self) -> Result<Vec<u8>, UciError> {
        self.send(&Command::get_caps_info())?;
        self.read_response(self.config.dispatch.frame_len)
    }

    /// Write one configuration parameter; returns the Config-Status
    /// notification.
    #[instrument(skip(self, config_id, value), fields(config_id = %format!("0x{:02X}", config_id), len = value.len()))]
    pub fn set_config(&self, config_id: u8, value: &[u8]) -> Result<Notification, UciError> {
        let command = Command::set_config(config_id, value).map_err(UciError::InvalidCommand)?;
        self.command_with_notification(&command, NotificationCode::ConfigStatus)
    }

    /// Read one configuration parameter. The device answers synchronously
    /// with a fixed-length frame.
    #[instrument(skip(self, config_id), fields(config_id = %format!("0x{:02X}", config_id)))]
    pub fn get_config(&self, config_id: u8) -> Result<Vec<u8>, UciError> {
        self.send(&Command::get_config(config_id))?;
        self.read_response(self.config.dispatch.frame_len)
    }

    /// Start a ranging session. The state moves to Active once the device
    /// confirms with a Session-Status notification.
    #[instrument(skip(self, session_id), fields(session_id = %format!("0x{:08X}", session_id)))]
    pub fn start_ranging(&self, session_id: u32) -> Result<Notification, UciError> {
        let ntf = self.command_with_notification(
            &Command::start_ranging(session_id),
            NotificationCode::SessionStatus,
        )?;
        info!(state = %self.state(), "Ranging session started");
        Ok(ntf)
    }

    #[instrument(skip(self, session_id), fields(session_id = %format!("0x{:08X}", session_id)))]
    pub fn stop_ranging(&self, session_id: u32) -> Result<Notification, UciError> {
        let ntf = self.command_with_notification(
            &Command::stop_ranging(session_id),
            NotificationCode::SessionStatus,
        )?;
        info!(state = %self.state(), "Ranging session stopped");
        Ok(ntf)
    }

    fn query_count(&self, command: &Command) -> Result<u16, UciError> {
        self.send(command)?;
        let bytes = self.read_response(COUNT_RESPONSE_LEN)?;
        decode_count(&bytes).map_err(UciError::Response)
    }

    /// Number of sessions currently active on the device.
    pub fn get_session_count(&self) -> Result<u16, UciError> {
        self.query_count(&Command::get_session_count())
    }

    /// Maximum number of concurrent sessions the device supports.
    pub fn get_max_sessions(&self) -> Result<u16, UciError> {
        self.query_count(&Command::get_max_sessions())
    }

    /// Apply the stored calibration values. Uses the longer calibration
    /// timeout.
    #[instrument(skip(self))]
    pub fn apply_calibration(&self) -> Result<Notification, UciError> {
        self.send(&Command::apply_calibration())?;
        let ntf = self.await_notification(
            NotificationCode::CalibrationApply,
            self.config.dispatch.calibration_timeout(),
        )?;
        info!("Calibration applied");
        Ok(ntf)
    }

    /// Bring a freshly loaded device into service: reset, then calibrate.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<(), UciError> {
        self.reset_device()?;
        self.apply_calibration()?;
        info!(state = %self.state(), "Device initialized");
        Ok(())
    }

    /// Upload a firmware image. On error the device must not be used.
    ///
    /// The interrupt listener stays off the bus for the whole upload.
    pub fn load_firmware(&self, source: &dyn FirmwareSource) -> Result<LoadReport, UciError> {
        let _paused = self.listener.pause();
        let loader = FirmwareLoader::with_observer(
            &self.link,
            self.config.firmware.clone(),
            self.observer.clone(),
        );
        Ok(loader.load(source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBus, MockDelay, MockIrq, MockPin, MockSpi};
    use crate::events::RecordingObserver;
    use crate::firmware::MemorySource;
    use crate::protocol::constants::*;
    use std::io::Read;
    use std::sync::Mutex;
    use std::thread;

    type MockDriver = UciDriver<MockSpi, MockPin, MockPin, MockDelay>;

    fn parts(bus: &MockBus) -> HardwareParts<MockSpi, MockPin, MockPin, MockIrq, MockDelay> {
        HardwareParts {
            spi: bus.spi(),
            cs: MockPin::new(),
            ce: MockPin::new(),
            irq: bus.irq_pin(),
            delay: MockDelay::new(),
        }
    }

    fn config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.dispatch.notification_timeout_ms = 1000;
        config
    }

    fn driver(bus: &MockBus) -> MockDriver {
        UciDriver::new(parts(bus), config()).unwrap()
    }

    #[test]
    fn test_reset_reaches_idle() {
        let bus = MockBus::new();
        bus.notify_on(&[0x00, 0x00], &[DEVICE_STATUS_NTF, 0x01]);
        let driver = driver(&bus);
        assert!(driver.is_listening());
        assert_eq!(driver.state(), UwbsState::Inactive);

        let ntf = driver.reset_device().unwrap();

        assert_eq!(ntf.code(), Some(NotificationCode::DeviceStatus));
        assert_eq!(driver.state(), UwbsState::Idle);
        assert_eq!(bus.get_writes(), vec![vec![0x00, 0x00, 0x00, 0x00]]);
    }

    #[test]
    fn test_ranging_session_cycle() {
        let bus = MockBus::new();
        bus.notify_on(&[0x00, 0x00], &[DEVICE_STATUS_NTF]);
        bus.notify_on(&[0x00, 0x05], &[SESSION_STATUS_NTF, SESSION_STARTED]);
        bus.notify_on(&[0x00, 0x06], &[SESSION_STATUS_NTF, SESSION_STOPPED]);
        let driver = driver(&bus);

        driver.reset_device().unwrap();
        driver.start_ranging(0x1234_5678).unwrap();
        assert_eq!(driver.state(), UwbsState::Active);
        driver.stop_ranging(0x1234_5678).unwrap();
        assert_eq!(driver.state(), UwbsState::Idle);

        let writes = bus.get_writes();
        assert_eq!(writes[1], vec![0x00, 0x05, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(writes[2], vec![0x00, 0x06, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_missing_notification_times_out() {
        let bus = MockBus::new();
        let mut config = config();
        config.dispatch.notification_timeout_ms = 50;
        let driver: MockDriver = UciDriver::new(parts(&bus), config).unwrap();

        match driver.reset_device() {
            Err(UciError::NotificationTimeout { code, timeout_ms }) => {
                assert_eq!(code, NotificationCode::DeviceStatus);
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Command went out; state untouched.
        assert_eq!(bus.get_writes().len(), 1);
        assert_eq!(driver.state(), UwbsState::Inactive);

        // The driver keeps working after a timeout.
        bus.notify_on(&[0x00, 0x01], &[DEVICE_INFO_NTF, 0x02, 0x00]);
        let info = driver.get_device_info().unwrap();
        assert_eq!(&info.as_bytes()[..3], &[DEVICE_INFO_NTF, 0x02, 0x00]);
    }

    #[test]
    fn test_unrelated_notification_stays_queued() {
        let bus = MockBus::new();
        // Device answers a reset with an unsolicited config status first.
        bus.notify_on(&[0x00, 0x00], &[CONFIG_STATUS_NTF, 0x00]);
        bus.notify_on(&[0x00, 0x00], &[DEVICE_STATUS_NTF]);
        let driver = driver(&bus);

        driver.reset_device().unwrap();
        let ntf = driver
            .dispatcher()
            .wait_for(NotificationCode::ConfigStatus, Duration::from_secs(1))
            .unwrap();
        assert_eq!(&ntf.as_bytes()[..2], &[CONFIG_STATUS_NTF, 0x00]);
    }

    #[test]
    fn test_set_and_get_config() {
        let bus = MockBus::new();
        bus.notify_on(&[0x00, 0x03], &[CONFIG_STATUS_NTF, 0x00]);
        bus.respond_on(&[0x00, 0x04], &[0x00, 0x04, 0x01, 0x01, 0x05]);
        let driver = driver(&bus);

        driver.set_config(0x01, &[0x05]).unwrap();
        let value = driver.get_config(0x01).unwrap();

        assert_eq!(value.len(), NOTIFICATION_FRAME_LEN);
        assert_eq!(&value[..5], &[0x00, 0x04, 0x01, 0x01, 0x05]);
        assert_eq!(
            bus.get_writes(),
            vec![vec![0x00, 0x03, 0x01, 0x01, 0x05], vec![0x00, 0x04, 0x01]]
        );
    }

    #[test]
    fn test_oversized_config_value_rejected() {
        let bus = MockBus::new();
        let driver = driver(&bus);

        assert!(matches!(
            driver.set_config(0x02, &[0u8; 256]),
            Err(UciError::InvalidCommand(CodecError::ValueTooLong { .. }))
        ));
        assert!(bus.get_writes().is_empty());
    }

    #[test]
    fn test_session_counts() {
        let bus = MockBus::new();
        bus.respond_on(&[0x00, 0x09], &[0x03, 0x00]);
        bus.respond_on(&[0x00, 0x0A], &[0x00, 0x01]);
        let observer = Arc::new(RecordingObserver::new());
        let driver: MockDriver =
            UciDriver::with_observer(parts(&bus), config(), observer.clone()).unwrap();

        assert_eq!(driver.get_session_count().unwrap(), 3);
        assert_eq!(driver.get_max_sessions().unwrap(), 256);

        let packets: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                UciEvent::Packet {
                    direction, data, ..
                } => Some((direction, data)),
                _ => None,
            })
            .collect();
        assert_eq!(packets[0], (PacketDirection::Tx, vec![0x00, 0x09]));
        assert_eq!(packets[1], (PacketDirection::Rx, vec![0x03, 0x00]));
    }

    #[test]
    fn test_initialize_resets_and_calibrates() {
        let bus = MockBus::new();
        bus.notify_on(&[0x00, 0x00], &[DEVICE_STATUS_NTF]);
        bus.notify_on(&[0x00, 0x0C], &[CALIBRATION_APPLY_NTF, 0x00]);
        let driver = driver(&bus);

        driver.initialize().unwrap();

        assert_eq!(driver.state(), UwbsState::Idle);
        assert_eq!(bus.get_writes()[1], vec![0x00, 0x0C]);
    }

    #[test]
    fn test_caps_info_read_back() {
        let bus = MockBus::new();
        bus.respond_on(&[0x00, 0x02], &[0x00, 0x02, 0x07]);
        let driver = driver(&bus);

        let caps = driver.get_caps_info().unwrap();
        assert_eq!(&caps[..3], &[0x00, 0x02, 0x07]);
        assert_eq!(bus.get_writes(), vec![vec![0x00, 0x02, 0x00, 0x00]]);
    }

    #[test]
    fn test_firmware_retry_through_driver() {
        let bus = MockBus::new();
        let hw = parts(&bus);
        let ce = hw.ce.clone();
        let driver: MockDriver = UciDriver::new(hw, config()).unwrap();
        bus.corrupt_transfer(2);

        let image = MemorySource::new(vec![0x5A; 600]);
        let report = driver.load_firmware(&image).unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(report.chunks, 3);
        assert_eq!(bus.transfer_count(), 5);
        assert_eq!(ce.falling_edges(), 1);
    }

    #[test]
    fn test_firmware_exhaustion_surfaces() {
        let bus = MockBus::new();
        let driver = driver(&bus);
        for index in 1..=3 {
            bus.corrupt_transfer(index);
        }

        let err = driver
            .load_firmware(&MemorySource::new(vec![0x11; 10]))
            .unwrap_err();
        assert!(matches!(
            err,
            UciError::Firmware(FirmwareError::AttemptsExhausted { attempts: 3, .. })
        ));
    }

    /// Select framings, transfers and interrupt level seen when the image
    /// runs out.
    type BusSnapshot = Arc<Mutex<Option<(usize, usize, bool)>>>;

    /// Image that raises a notification while the second chunk is read.
    struct InterruptingSource {
        data: Vec<u8>,
        bus: MockBus,
        cs: MockPin,
        at_end: BusSnapshot,
    }

    struct InterruptingReader<'a> {
        source: &'a InterruptingSource,
        pos: usize,
    }

    impl Read for InterruptingReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let source = self.source;
            if self.pos == 256 {
                source.bus.push_notification(&[DEVICE_STATUS_NTF, 0x01]);
                // Give an unpaused listener ample time to read it.
                thread::sleep(Duration::from_millis(50));
            }
            let rest = &source.data[self.pos.min(source.data.len())..];
            if rest.is_empty() {
                *source.at_end.lock().unwrap() = Some((
                    source.cs.falling_edges(),
                    source.bus.transfer_count(),
                    source.bus.irq_asserted(),
                ));
                return Ok(0);
            }
            let n = rest.len().min(buf.len());
            buf[..n].copy_from_slice(&rest[..n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl FirmwareSource for InterruptingSource {
        fn describe(&self) -> String {
            "<interrupting>".to_string()
        }

        fn open(&self) -> std::io::Result<Box<dyn Read + '_>> {
            Ok(Box::new(InterruptingReader {
                source: self,
                pos: 0,
            }))
        }
    }

    #[test]
    fn test_listener_stays_off_bus_during_upload() {
        let bus = MockBus::new();
        let hw = parts(&bus);
        let cs = hw.cs.clone();
        let driver: MockDriver = UciDriver::new(hw, config()).unwrap();

        let at_end: BusSnapshot = Arc::new(Mutex::new(None));
        let source = InterruptingSource {
            data: vec![0xA5; 600],
            bus: bus.clone(),
            cs: cs.clone(),
            at_end: at_end.clone(),
        };

        let report = driver.load_firmware(&source).unwrap();
        assert_eq!(report.chunks, 3);

        let snapshot = *at_end.lock().unwrap();
        let (edges, transfers, irq) = snapshot.unwrap();
        // Every select framing so far belonged to a chunk transfer.
        assert_eq!(edges, transfers);
        assert!(irq, "notification was read during the upload");
        assert!(bus.get_transfers().iter().all(|t| t.iter().all(|&b| b == 0xA5)));

        // Picked up once the upload is over.
        let ntf = driver
            .dispatcher()
            .wait_for(NotificationCode::DeviceStatus, Duration::from_secs(1))
            .unwrap();
        assert_eq!(&ntf.as_bytes()[..2], &[DEVICE_STATUS_NTF, 0x01]);
    }

    /// Observer that stalls on every notification.
    struct StallingObserver;

    impl UciObserver for StallingObserver {
        fn on_event(&self, event: &UciEvent) {
            if matches!(event, UciEvent::Notification(_)) {
                thread::sleep(Duration::from_millis(300));
            }
        }
    }

    #[test]
    fn test_slow_observer_does_not_delay_capture() {
        let bus = MockBus::new();
        let driver: MockDriver =
            UciDriver::with_observer(parts(&bus), config(), Arc::new(StallingObserver)).unwrap();

        bus.push_notification(&[DEVICE_INFO_NTF, 0x01]);
        assert!(
            driver
                .dispatcher()
                .wait_for(NotificationCode::DeviceInfo, Duration::from_secs(1))
                .is_some()
        );

        // The observer is still busy with the first frame.
        bus.push_notification(&[CONFIG_STATUS_NTF, 0x00]);
        let ntf = driver
            .dispatcher()
            .wait_for(NotificationCode::ConfigStatus, Duration::from_millis(100));
        assert!(ntf.is_some());
    }

    #[test]
    fn test_notification_events_reach_observer() {
        let bus = MockBus::new();
        bus.notify_on(&[0x00, 0x00], &[DEVICE_STATUS_NTF]);
        let observer = Arc::new(RecordingObserver::new());
        let driver: MockDriver =
            UciDriver::with_observer(parts(&bus), config(), observer.clone()).unwrap();

        driver.reset_device().unwrap();
        // Dropping the driver flushes pending events.
        drop(driver);

        let events = observer.events();
        assert!(events.iter().any(|e| matches!(e, UciEvent::Notification(_))));
        assert!(events.iter().any(|e| matches!(
            e,
            UciEvent::StateChanged {
                to: UwbsState::Idle,
                ..
            }
        )));
    }

    #[test]
    fn test_bus_failure_surfaces() {
        let bus = MockBus::new();
        let driver = driver(&bus);
        bus.fail_next(1);

        assert!(matches!(
            driver.get_session_count(),
            Err(UciError::Bus(BusError::Transfer { .. }))
        ));
    }
}

//! Owns the indicator lamps and the sensor link and runs the control logic.
//!
//! A [`DeviceController`] is a cheap, cloneable handle. It is the only writer
//! of the lamp lines: direct lamp control, register writes and the periodic
//! indicator engine all go through the same state lock.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};

use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{DeviceConfig, TfLunaConfig};
use crate::gpio::{GpioChip, GpioLine, Level};
use crate::indicator::{IndicatorMode, IndicatorModeEngine, Lamp, LampOutputs};
use crate::protocol::{Error as ProtocolError, SampleRate};
use crate::registers::{self, DeviceId, RegisterBank, RegisterValue};
use crate::tokio_async::{DeviceStatus, ObserveTargets, TfLuna};
use crate::tokio_common::{lock, Error, Result};

const EVENT_CAPACITY: usize = 16;

/// What to do with the distance measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String"))]
pub enum MeasurementAction {
    /// Continuous sampling at the configured rate, lamps in `AUTO`.
    Start,
    /// Stop sampling, lamps back to `GREEN`.
    Stop,
    /// One measurement, only while sampling is stopped.
    Single,
}

impl FromStr for MeasurementAction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "START" => Ok(Self::Start),
            "STOP" => Ok(Self::Stop),
            "SINGLE" => Ok(Self::Single),
            _ => Err(ProtocolError::UnknownMeasurementAction(s.to_string())),
        }
    }
}

impl TryFrom<String> for MeasurementAction {
    type Error = ProtocolError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for MeasurementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Single => "SINGLE",
        })
    }
}

/// Notifications for the address-space bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    MeasurementStarted,
    MeasurementStopped,
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MeasurementStarted => "measurement started",
            Self::MeasurementStopped => "measurement stopped",
        })
    }
}

struct IndicatorLights {
    red: Box<dyn GpioLine>,
    yellow: Box<dyn GpioLine>,
    green: Box<dyn GpioLine>,
}

impl IndicatorLights {
    fn request(gpio: &dyn GpioChip, config: &DeviceConfig) -> Result<Self> {
        let request = |lamp: Lamp| -> Result<Box<dyn GpioLine>> {
            let pin = config.lamp(lamp);
            info!("Initializing {lamp} indicator light on GPIO {}", pin.pin);
            Ok(gpio.request_line(pin.pin, pin.mode)?)
        };
        Ok(Self {
            red: request(Lamp::Red)?,
            yellow: request(Lamp::Yellow)?,
            green: request(Lamp::Green)?,
        })
    }

    fn line(&self, lamp: Lamp) -> &dyn GpioLine {
        match lamp {
            Lamp::Red => self.red.as_ref(),
            Lamp::Yellow => self.yellow.as_ref(),
            Lamp::Green => self.green.as_ref(),
        }
    }

    fn line_mut(&mut self, lamp: Lamp) -> &mut dyn GpioLine {
        match lamp {
            Lamp::Red => self.red.as_mut(),
            Lamp::Yellow => self.yellow.as_mut(),
            Lamp::Green => self.green.as_mut(),
        }
    }

    fn write(&mut self, outputs: LampOutputs) -> io::Result<()> {
        for lamp in Lamp::ALL {
            self.line_mut(lamp).set(outputs.get(lamp))?;
        }
        Ok(())
    }
}

struct State {
    mode: IndicatorMode,
    engine: IndicatorModeEngine,
    lamps: Option<IndicatorLights>,
}

struct Bank<'a> {
    lamps: &'a mut Option<IndicatorLights>,
    sensor: Option<&'a TfLuna>,
}

impl RegisterBank for Bank<'_> {
    fn read_lamp(&self, lamp: Lamp) -> Result<Level> {
        let lamps = self.lamps.as_ref().ok_or(Error::NotInitialized)?;
        Ok(lamps.line(lamp).get()?)
    }

    fn write_lamp(&mut self, lamp: Lamp, level: Level) -> Result<()> {
        let lamps = self.lamps.as_mut().ok_or(Error::NotInitialized)?;
        Ok(lamps.line_mut(lamp).set(level)?)
    }

    fn distance_cm(&self) -> Result<u16> {
        self.sensor
            .map(TfLuna::measurement_cm)
            .ok_or(Error::NotInitialized)
    }
}

struct Inner {
    config: Arc<DeviceConfig>,
    gpio: Arc<dyn GpioChip>,
    state: Mutex<State>,
    sensor: Mutex<Option<Arc<TfLuna>>>,
    observe: Mutex<ObserveTargets>,
    events: broadcast::Sender<ControllerEvent>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn tick(&self) {
        let distance_cm = lock(&self.sensor)
            .as_ref()
            .map_or(0, |sensor| sensor.measurement_cm());
        let thresholds = self.config.tf_luna.thresholds();

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(outputs) = state.engine.tick(state.mode, distance_cm, thresholds) {
            if let Some(lamps) = state.lamps.as_mut() {
                if let Err(err) = lamps.write(outputs) {
                    warn!("Cannot update indicator lights: {err}");
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
    }
}

/// Handle to the lamps and the distance sensor.
#[derive(Clone)]
pub struct DeviceController {
    inner: Arc<Inner>,
}

impl fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceController")
            .field("mode", &self.indicator_mode())
            .field("sensor", &lock(&self.inner.sensor))
            .finish_non_exhaustive()
    }
}

impl DeviceController {
    pub fn new(config: Arc<DeviceConfig>, gpio: Arc<dyn GpioChip>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                gpio,
                state: Mutex::new(State {
                    mode: IndicatorMode::Green,
                    engine: IndicatorModeEngine::new(),
                    lamps: None,
                }),
                sensor: Mutex::new(None),
                observe: Mutex::new(ObserveTargets::default()),
                events,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// The sensor link, once initialization opened it.
    pub fn sensor(&self) -> Option<Arc<TfLuna>> {
        lock(&self.inner.sensor).clone()
    }

    fn require_sensor(&self) -> Result<Arc<TfLuna>> {
        self.sensor().ok_or(Error::NotInitialized)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ControllerEvent) {
        info!("Event: {event}");
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    async fn wait_for_gpio(&self) -> Result<()> {
        let gpio = &self.inner.config.gpio;
        let mut attempt = 1;
        while !self.inner.gpio.is_available() {
            if attempt >= gpio.availability_attempts {
                error!("GPIO still not available after {attempt} checks");
                return Err(Error::GpioUnavailable);
            }
            info!(
                "GPIO is not available, check {attempt}/{}",
                gpio.availability_attempts
            );
            tokio::time::sleep(gpio.availability_interval).await;
            attempt += 1;
        }
        Ok(())
    }

    /// Runs the start-up sequence.
    ///
    /// Waits for GPIO, claims the lamp lines, opens the sensor link through
    /// `open_transport`, then resets and configures the sensor. Any failing
    /// step is logged and ends the sequence.
    pub async fn initialize<F, T>(&self, open_transport: F) -> Result<()>
    where
        F: FnOnce(&TfLunaConfig) -> Result<T>,
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let result = self.run_initialization(open_transport).await;
        match &result {
            Ok(()) => info!("Device controller initialized"),
            Err(err) => error!("Device controller initialization failed: {err}"),
        }
        result
    }

    /// [`DeviceController::initialize`] on the configured serial port.
    #[cfg(feature = "tokio-serial")]
    pub async fn initialize_serial(&self) -> Result<()> {
        self.initialize(|config| {
            crate::tokio_common::open_serial(&config.serial_port, &config.baud_rate)
        })
        .await
    }

    async fn run_initialization<F, T>(&self, open_transport: F) -> Result<()>
    where
        F: FnOnce(&TfLunaConfig) -> Result<T>,
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = self.inner.config.clone();

        self.wait_for_gpio().await?;
        let lamps = IndicatorLights::request(self.inner.gpio.as_ref(), &config)?;
        lock(&self.inner.state).lamps = Some(lamps);

        let tf_luna = &config.tf_luna;
        info!(
            "Initializing {} on {} at {} baud",
            tf_luna.device_id, tf_luna.serial_port, tf_luna.baud_rate
        );
        let transport = open_transport(tf_luna)?;
        let sensor = Arc::new(TfLuna::attach(transport, tf_luna.link_options()));
        sensor.observe(*lock(&self.inner.observe));
        *lock(&self.inner.sensor) = Some(sensor.clone());

        let status = sensor.soft_reset().await?;
        info!("Soft reset: {status}");
        tokio::time::sleep(config.reset_settle_time).await;

        let baud_rate = sensor.set_baud_rate(tf_luna.baud_rate).await?;
        info!("Baud rate: {baud_rate}");
        let sample_rate = sensor.set_sample_rate(SampleRate::IDLE).await?;
        info!("Sample rate: {sample_rate}");
        let status = sensor.save_settings().await?;
        info!("Save settings: {status}");
        let version = sensor.get_version().await?;
        info!("Firmware version: {version}");

        if tf_luna.auto_start {
            self.measurement_control(MeasurementAction::Start).await?;
        }

        self.start_indicator_engine();
        Ok(())
    }

    fn start_indicator_engine(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(IndicatorModeEngine::PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.tick(),
                    None => break,
                }
            }
        });
        if let Some(previous) = lock(&self.inner.ticker).replace(ticker) {
            previous.abort();
        }
    }

    /// Runs one indicator engine step right away.
    pub fn tick_indicators(&self) {
        self.inner.tick();
    }

    pub fn indicator_mode(&self) -> IndicatorMode {
        lock(&self.inner.state).mode
    }

    /// Last values reported by the sensor, defaults before initialization.
    pub fn status(&self) -> DeviceStatus {
        self.sensor()
            .map(|sensor| sensor.status())
            .unwrap_or_default()
    }

    pub fn is_gpio_available(&self) -> bool {
        self.inner.gpio.is_available()
    }

    /// Starts, stops or triggers distance measurement.
    pub async fn measurement_control(&self, action: MeasurementAction) -> Result<()> {
        let sensor = self.require_sensor()?;
        match action {
            MeasurementAction::Start => {
                let rate = self.inner.config.tf_luna.sample_rate()?;
                lock(&self.inner.state).mode = IndicatorMode::Auto;
                sensor.set_sample_rate(rate).await?;
                self.emit(ControllerEvent::MeasurementStarted);
            }
            MeasurementAction::Stop => {
                lock(&self.inner.state).mode = IndicatorMode::Green;
                sensor.set_sample_rate(SampleRate::IDLE).await?;
                self.emit(ControllerEvent::MeasurementStopped);
            }
            MeasurementAction::Single => {
                if !sensor.trigger_measurement().await? {
                    info!("Single measurement ignored while sampling");
                }
            }
        }
        Ok(())
    }

    /// Writes all three lamps and switches to `MANUAL`.
    pub fn set_lamps(&self, red: Level, yellow: Level, green: Level) -> Result<()> {
        if !self.inner.gpio.is_available() {
            return Err(Error::GpioUnavailable);
        }
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let lamps = state.lamps.as_mut().ok_or(Error::GpioUnavailable)?;
        state.mode = IndicatorMode::Manual;
        lamps.write(LampOutputs::new(red, yellow, green))?;
        debug!("Indicator lights set to red={red} yellow={yellow} green={green}");
        Ok(())
    }

    pub fn set_mode(&self, mode: IndicatorMode) -> Result<()> {
        if !self.inner.gpio.is_available() {
            return Err(Error::GpioUnavailable);
        }
        lock(&self.inner.state).mode = mode;
        info!("Indicator light mode: {mode}");
        Ok(())
    }

    /// Reads a register. The distance is the cached latest measurement.
    pub fn get(&self, id: DeviceId) -> Result<RegisterValue> {
        let sensor = self.sensor();
        let mut guard = lock(&self.inner.state);
        let bank = Bank {
            lamps: &mut guard.lamps,
            sensor: sensor.as_deref(),
        };
        registers::read(&bank, id)
    }

    /// Writes a register. Writing a lamp switches to `MANUAL`.
    pub fn set(&self, id: DeviceId, value: RegisterValue) -> Result<()> {
        let sensor = self.sensor();
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let mut bank = Bank {
            lamps: &mut state.lamps,
            sensor: sensor.as_deref(),
        };
        registers::write(&mut bank, id, value)?;
        if id.lamp().is_some() {
            state.mode = IndicatorMode::Manual;
        }
        Ok(())
    }

    /// Enables or disables the measurement and parser log streams.
    pub fn observe(&self, targets: ObserveTargets) -> bool {
        *lock(&self.inner.observe) = targets;
        if let Some(sensor) = self.sensor() {
            sensor.observe(targets);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::CommandKind;
    use crate::gpio::SimulatedGpio;
    use crate::tokio_async::tests::{sensor_reply, spawn_sensor};
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const RED: u32 = 17;
    const YELLOW: u32 = 27;
    const GREEN: u32 = 22;

    fn controller(config: DeviceConfig) -> (DeviceController, SimulatedGpio) {
        let gpio = SimulatedGpio::new();
        let controller = DeviceController::new(Arc::new(config), Arc::new(gpio.clone()));
        (controller, gpio)
    }

    async fn initialized(
        config: DeviceConfig,
    ) -> (DeviceController, SimulatedGpio, JoinHandle<Vec<Vec<u8>>>) {
        let (controller, gpio) = controller(config);
        let (client, device) = tokio::io::duplex(256);
        let sensor_task = spawn_sensor(device, sensor_reply);
        controller.initialize(move |_| Ok(client)).await.unwrap();
        (controller, gpio, sensor_task)
    }

    fn lamps(gpio: &SimulatedGpio) -> [Option<Level>; 3] {
        [gpio.level(RED), gpio.level(YELLOW), gpio.level(GREEN)]
    }

    const ON: Option<Level> = Some(Level::High);
    const OFF: Option<Level> = Some(Level::Low);

    #[tokio::test(start_paused = true)]
    async fn initialization_sequence() {
        let config = DeviceConfig::with_pins(RED, YELLOW, GREEN);
        let start = tokio::time::Instant::now();
        let (controller, _gpio, sensor_task) = initialized(config).await;
        assert!(start.elapsed() >= Duration::from_secs(5));

        assert_eq!(controller.indicator_mode(), IndicatorMode::Green);
        let status = controller.status();
        assert_eq!(status.sample_rate, 0);
        assert_eq!(status.baud_rate, 115_200);
        assert_eq!(status.version.to_string(), "1.3.6");

        drop(controller);
        let commands: Vec<u8> = sensor_task.await.unwrap().iter().map(|c| c[2]).collect();
        assert_eq!(commands, vec![0x02, 0x06, 0x03, 0x11, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_begins_measuring() {
        let mut config = DeviceConfig::with_pins(RED, YELLOW, GREEN);
        config.tf_luna.auto_start = true;
        let (controller, _gpio) = controller(config);
        let mut events = controller.subscribe();

        let (client, device) = tokio::io::duplex(256);
        let _sensor_task = spawn_sensor(device, sensor_reply);
        controller.initialize(move |_| Ok(client)).await.unwrap();

        assert_eq!(controller.indicator_mode(), IndicatorMode::Auto);
        assert_eq!(controller.status().sample_rate, 10);
        assert_eq!(events.recv().await.unwrap(), ControllerEvent::MeasurementStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_gpio_aborts_initialization() {
        let (controller, gpio) = controller(DeviceConfig::with_pins(RED, YELLOW, GREEN));
        gpio.set_available(false);

        let start = tokio::time::Instant::now();
        let result = controller
            .initialize(|_| -> Result<DuplexStream> { panic!("serial port must not be opened") })
            .await;
        assert_matches!(result, Err(Error::GpioUnavailable));
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert!(controller.sensor().is_none());
        assert_matches!(
            controller.measurement_control(MeasurementAction::Start).await,
            Err(Error::NotInitialized)
        );
    }

    fn without_baud_rate_reply(command: &[u8]) -> Vec<u8> {
        match command[2] {
            0x06 => Vec::new(),
            _ => sensor_reply(command),
        }
    }

    fn without_version_reply(command: &[u8]) -> Vec<u8> {
        match command[2] {
            0x01 => Vec::new(),
            _ => sensor_reply(command),
        }
    }

    /// Runs initialization against `respond` and checks that it stopped at `failing`.
    async fn assert_initialization_stops(
        respond: fn(&[u8]) -> Vec<u8>,
        failing: CommandKind,
        expected_commands: &[u8],
    ) {
        let (controller, gpio) = controller(DeviceConfig::with_pins(RED, YELLOW, GREEN));
        let (client, device) = tokio::io::duplex(256);
        let sensor_task = spawn_sensor(device, respond);

        let result = controller.initialize(move |_| Ok(client)).await;
        assert_matches!(result, Err(Error::Timeout(kind, _)) if kind == failing);

        // the indicator engine never started
        tokio::time::sleep(IndicatorModeEngine::PERIOD * 6).await;
        assert!(lock(&controller.inner.ticker).is_none());
        assert_eq!(lamps(&gpio), [OFF, OFF, OFF]);
        assert_eq!(gpio.write_count(), 0);

        drop(controller);
        let commands: Vec<u8> = sensor_task.await.unwrap().iter().map(|c| c[2]).collect();
        assert_eq!(commands, expected_commands);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_baud_rate_reply_aborts_initialization() {
        assert_initialization_stops(
            without_baud_rate_reply,
            CommandKind::SetBaudRate,
            &[0x02, 0x06],
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_version_reply_aborts_initialization() {
        assert_initialization_stops(
            without_version_reply,
            CommandKind::GetVersion,
            &[0x02, 0x06, 0x03, 0x11, 0x01],
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn direct_lamp_control_is_manual() {
        let (controller, gpio, _sensor) =
            initialized(DeviceConfig::with_pins(RED, YELLOW, GREEN)).await;

        controller.tick_indicators();
        assert_eq!(lamps(&gpio), [OFF, OFF, ON]);

        controller
            .set_lamps(Level::High, Level::Low, Level::High)
            .unwrap();
        assert_eq!(controller.indicator_mode(), IndicatorMode::Manual);
        assert_eq!(lamps(&gpio), [ON, OFF, ON]);

        let writes = gpio.write_count();
        controller.tick_indicators();
        controller.tick_indicators();
        assert_eq!(lamps(&gpio), [ON, OFF, ON]);
        assert_eq!(gpio.write_count(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn lamp_control_requires_gpio() {
        let (controller, gpio, _sensor) =
            initialized(DeviceConfig::with_pins(RED, YELLOW, GREEN)).await;
        gpio.set_available(false);

        assert_matches!(
            controller.set_lamps(Level::High, Level::High, Level::High),
            Err(Error::GpioUnavailable)
        );
        assert_matches!(
            controller.set_mode(IndicatorMode::RedFlashing),
            Err(Error::GpioUnavailable)
        );
        assert_eq!(controller.indicator_mode(), IndicatorMode::Green);
    }

    #[tokio::test(start_paused = true)]
    async fn flashing_mode_blinks() {
        let (controller, gpio, _sensor) =
            initialized(DeviceConfig::with_pins(RED, YELLOW, GREEN)).await;
        controller.set_mode(IndicatorMode::RedFlashing).unwrap();

        controller.tick_indicators();
        let first = lamps(&gpio);
        controller.tick_indicators();
        let second = lamps(&gpio);
        assert_ne!(first[0], second[0]);
        assert_eq!(first[1..], [OFF, OFF]);
        assert_eq!(second[1..], [OFF, OFF]);
    }

    #[tokio::test(start_paused = true)]
    async fn indicator_engine_runs_periodically() {
        let (controller, gpio, _sensor) =
            initialized(DeviceConfig::with_pins(RED, YELLOW, GREEN)).await;
        assert_eq!(lamps(&gpio), [OFF, OFF, OFF]);

        tokio::time::sleep(IndicatorModeEngine::PERIOD + Duration::from_millis(10)).await;
        assert_eq!(lamps(&gpio), [OFF, OFF, ON]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_measurement() {
        let (controller, _gpio, sensor_task) =
            initialized(DeviceConfig::with_pins(RED, YELLOW, GREEN)).await;
        let mut events = controller.subscribe();

        controller
            .measurement_control(MeasurementAction::Start)
            .await
            .unwrap();
        assert_eq!(controller.indicator_mode(), IndicatorMode::Auto);
        assert_eq!(controller.status().sample_rate, 10);

        // sampling: no trigger is written
        controller
            .measurement_control(MeasurementAction::Single)
            .await
            .unwrap();

        controller
            .measurement_control(MeasurementAction::Stop)
            .await
            .unwrap();
        assert_eq!(controller.indicator_mode(), IndicatorMode::Green);
        assert_eq!(controller.status().sample_rate, 0);

        assert_eq!(events.recv().await.unwrap(), ControllerEvent::MeasurementStarted);
        assert_eq!(events.recv().await.unwrap(), ControllerEvent::MeasurementStopped);

        drop(controller);
        let commands = sensor_task.await.unwrap();
        assert!(commands.iter().all(|command| command[2] != 0x04));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_mode_follows_distance() {
        let (controller, gpio, _sensor) =
            initialized(DeviceConfig::with_pins(RED, YELLOW, GREEN)).await;
        let sensor = controller.sensor().unwrap();
        let mut measurements = sensor.subscribe_measurements();

        controller.set_mode(IndicatorMode::Auto).unwrap();
        controller
            .measurement_control(MeasurementAction::Single)
            .await
            .unwrap();
        measurements.changed().await.unwrap();
        assert_eq!(
            controller.get(DeviceId::DistanceSensor).unwrap(),
            RegisterValue::DistanceCm(150)
        );

        controller.tick_indicators();
        assert_eq!(lamps(&gpio), [OFF, OFF, ON]);
    }

    #[tokio::test(start_paused = true)]
    async fn register_access() {
        let (uninitialized, _) = controller(DeviceConfig::with_pins(RED, YELLOW, GREEN));
        assert_matches!(
            uninitialized.get(DeviceId::IndicatorLightRed),
            Err(Error::NotInitialized)
        );

        let (controller, gpio, _sensor) =
            initialized(DeviceConfig::with_pins(RED, YELLOW, GREEN)).await;
        controller
            .set(DeviceId::IndicatorLightYellow, RegisterValue::Level(Level::High))
            .unwrap();
        assert_eq!(gpio.level(YELLOW), ON);
        assert_eq!(controller.indicator_mode(), IndicatorMode::Manual);
        assert_eq!(
            controller.get(DeviceId::IndicatorLightYellow).unwrap(),
            RegisterValue::Level(Level::High)
        );
        assert_eq!(
            controller.get(DeviceId::DistanceSensor).unwrap(),
            RegisterValue::DistanceCm(0)
        );
        assert_matches!(
            controller.set(DeviceId::DistanceSensor, RegisterValue::DistanceCm(1)),
            Err(Error::ReadOnly(DeviceId::DistanceSensor))
        );
    }

    #[tokio::test]
    async fn observe_before_initialization() {
        let (controller, _) = controller(DeviceConfig::with_pins(RED, YELLOW, GREEN));
        assert!(controller.observe(ObserveTargets {
            measurements: true,
            parser_command_response: false,
        }));
        assert_eq!(controller.status(), DeviceStatus::default());
        assert_eq!("stop".parse::<MeasurementAction>(), Ok(MeasurementAction::Stop));
        assert_matches!(
            "pause".parse::<MeasurementAction>(),
            Err(ProtocolError::UnknownMeasurementAction(_))
        );
    }
}

//! Request/response surface of the PLC.
//!
//! [`PlcService`] wraps a [`DeviceController`] for the outer layers: control
//! requests in the shape of the HTTP payload, observe requests, and the
//! variables and methods declared for the address-space bridge. Control and
//! method calls never return an error; failures become a `succeeded = false`
//! response carrying the error message.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::config::{AssetRootConfig, TfLunaConfig};
use crate::controller::{ControllerEvent, DeviceController, MeasurementAction};
use crate::gpio::Level;
use crate::indicator::IndicatorMode;
use crate::registers::{DeviceId, RegisterValue};
use crate::tokio_async::ObserveTargets;
use crate::tokio_common::{Error, Result};

/// Direct lamp levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct IndicatorLightAction {
    #[cfg_attr(feature = "serde", serde(rename = "ledRedState"))]
    pub red: Level,
    #[cfg_attr(feature = "serde", serde(rename = "ledYellowState"))]
    pub yellow: Level,
    #[cfg_attr(feature = "serde", serde(rename = "ledGreenState"))]
    pub green: Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct IndicatorModeAction {
    pub mode: IndicatorMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct MeasurementRequest {
    pub action: MeasurementAction,
}

/// A control request, tagged by `action` with its arguments in `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "action", content = "data"))]
pub enum ControlRequest {
    #[cfg_attr(feature = "serde", serde(rename = "INDICATORLIGHT"))]
    IndicatorLight(IndicatorLightAction),
    #[cfg_attr(feature = "serde", serde(rename = "INDICATORMODE"))]
    IndicatorMode(IndicatorModeAction),
    #[cfg_attr(feature = "serde", serde(rename = "MEASUREMENT"))]
    Measurement(MeasurementRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ObserveRequest {
    pub observe_targets: ObserveTargets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ControlResponse {
    pub succeeded: bool,
    pub message: String,
}

impl ControlResponse {
    fn from_result(result: Result<String>) -> Self {
        match result {
            Ok(message) => {
                info!("{message}");
                Self {
                    succeeded: true,
                    message,
                }
            }
            Err(err) => {
                let message = format!("PLC request failed: {err}");
                error!("{message}");
                Self {
                    succeeded: false,
                    message,
                }
            }
        }
    }
}

/// Typed value of an address-space variable or method argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    Boolean(bool),
    UInt16(u16),
    String(String),
}

impl Variant {
    pub fn data_type_name(&self) -> &'static str {
        match self {
            Variant::Boolean(_) => "Boolean",
            Variant::UInt16(_) => "UInt16",
            Variant::String(_) => "String",
        }
    }

    fn from_register(value: RegisterValue, data_type_name: &str) -> Self {
        match (value, data_type_name) {
            (RegisterValue::Level(level), "Boolean") => Variant::Boolean(level.is_high()),
            (RegisterValue::Level(level), _) => Variant::UInt16(u8::from(level).into()),
            (RegisterValue::DistanceCm(cm), _) => Variant::UInt16(cm),
        }
    }

    fn to_register(&self, device: DeviceId) -> Result<RegisterValue> {
        match (self, device.lamp()) {
            (_, Some(_)) => self.as_level().map(RegisterValue::Level),
            (Variant::UInt16(cm), None) => Ok(RegisterValue::DistanceCm(*cm)),
            (other, None) => Err(Error::InvalidArguments(format!(
                "{other} cannot be written to {device}"
            ))),
        }
    }

    fn as_level(&self) -> Result<Level> {
        match self {
            Variant::Boolean(high) => Ok((*high).into()),
            Variant::UInt16(value) => u8::try_from(*value)
                .map_err(|_| Error::InvalidArguments(format!("{value} is not a lamp state")))
                .and_then(|v| Ok(Level::try_from(v)?)),
            Variant::String(s) => Ok(s.parse()?),
        }
    }

    fn as_str(&self) -> Result<&str> {
        match self {
            Variant::String(s) => Ok(s),
            other => Err(Error::InvalidArguments(format!(
                "expected a String argument, got {}",
                other.data_type_name()
            ))),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Boolean(v) => write!(f, "{v}"),
            Variant::UInt16(v) => write!(f, "{v}"),
            Variant::String(v) => f.write_str(v),
        }
    }
}

/// Methods the address-space bridge can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundMethod {
    /// Three lamp states: red, yellow, green.
    ControlIndicatorLights,
    /// One mode name.
    SetIndicatorLightMode,
    /// One measurement action name.
    ControlDistanceSensor,
}

impl BoundMethod {
    pub fn browse_name(&self) -> &'static str {
        match self {
            BoundMethod::ControlIndicatorLights => "controlIndicatorLights",
            BoundMethod::SetIndicatorLightMode => "setIndicatorLightMode",
            BoundMethod::ControlDistanceSensor => "controlDistanceSensor",
        }
    }
}

impl FromStr for BoundMethod {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [
            BoundMethod::ControlIndicatorLights,
            BoundMethod::SetIndicatorLightMode,
            BoundMethod::ControlDistanceSensor,
        ]
        .into_iter()
        .find(|method| method.browse_name() == s)
        .ok_or_else(|| Error::UnknownNode(s.to_string()))
    }
}

/// A declared variable and the register behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableBinding {
    pub asset: String,
    pub browse_name: String,
    pub device: DeviceId,
    pub data_type_name: String,
    pub writeable: bool,
    pub sample_interval: Option<Duration>,
}

/// Browse names resolved against the devices of the controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressBindings {
    root_folder_name: String,
    variables: HashMap<String, VariableBinding>,
    methods: HashMap<String, BoundMethod>,
}

impl AddressBindings {
    /// Resolves every declared node and method. Unknown names are logged and skipped.
    pub fn from_config(config: &AssetRootConfig) -> Self {
        let mut variables = HashMap::new();
        for asset in &config.assets {
            for node in &asset.nodes {
                match node.browse_name.parse::<DeviceId>() {
                    Ok(device) => {
                        debug!("Binding {}/{} to {device}", asset.name, node.browse_name);
                        variables.insert(
                            node.browse_name.clone(),
                            VariableBinding {
                                asset: asset.name.clone(),
                                browse_name: node.browse_name.clone(),
                                device,
                                data_type_name: node.data_type_name.clone(),
                                writeable: node.writeable,
                                sample_interval: node.sample_interval,
                            },
                        );
                    }
                    Err(err) => warn!("Skipping variable {}/{}: {err}", asset.name, node.browse_name),
                }
            }
        }

        let mut methods = HashMap::new();
        for method in &config.methods {
            match method.browse_name.parse::<BoundMethod>() {
                Ok(bound) => {
                    methods.insert(method.browse_name.clone(), bound);
                }
                Err(err) => warn!("Skipping method: {err}"),
            }
        }

        Self {
            root_folder_name: config.root_folder_name.clone(),
            variables,
            methods,
        }
    }

    pub fn root_folder_name(&self) -> &str {
        &self.root_folder_name
    }

    pub fn variable(&self, browse_name: &str) -> Option<&VariableBinding> {
        self.variables.get(browse_name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableBinding> {
        self.variables.values()
    }

    pub fn method(&self, browse_name: &str) -> Option<BoundMethod> {
        self.methods.get(browse_name).copied()
    }
}

/// Outcome of a method call: the two output arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResult {
    pub succeeded: bool,
    pub message: String,
}

impl From<Result<()>> for MethodResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                succeeded: true,
                message: String::from("Success"),
            },
            Err(err) => Self {
                succeeded: false,
                message: err.to_string(),
            },
        }
    }
}

/// The PLC as seen by the outer layers.
#[derive(Debug, Clone)]
pub struct PlcService {
    controller: DeviceController,
    bindings: Arc<AddressBindings>,
    ready: Arc<AtomicBool>,
}

impl PlcService {
    pub fn new(controller: DeviceController, bindings: AddressBindings) -> Self {
        Self {
            controller,
            bindings: Arc::new(bindings),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn controller(&self) -> &DeviceController {
        &self.controller
    }

    pub fn bindings(&self) -> &AddressBindings {
        &self.bindings
    }

    /// Whether the start-up sequence has finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Initializes the controller. Requests are answered once this returns,
    /// even if initialization failed.
    pub async fn start<F, T>(&self, open_transport: F) -> Result<()>
    where
        F: FnOnce(&TfLunaConfig) -> Result<T>,
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        info!("Starting background initialization of the PLC controller");
        let result = self.controller.initialize(open_transport).await;
        self.ready.store(true, Ordering::SeqCst);
        result
    }

    /// [`PlcService::start`] on the configured serial port.
    #[cfg(feature = "tokio-serial")]
    pub async fn start_serial(&self) -> Result<()> {
        self.start(|config| {
            crate::tokio_common::open_serial(&config.serial_port, &config.baud_rate)
        })
        .await
    }

    fn check_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Measurement start and stop notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.controller.subscribe()
    }

    pub async fn control(&self, request: ControlRequest) -> ControlResponse {
        debug!("Control request: {request:?}");
        ControlResponse::from_result(self.dispatch(request).await)
    }

    async fn dispatch(&self, request: ControlRequest) -> Result<String> {
        self.check_ready()?;
        match request {
            ControlRequest::IndicatorLight(action) => {
                self.controller
                    .set_lamps(action.red, action.yellow, action.green)?;
                Ok(format!(
                    "Indicator lights set to red={} yellow={} green={}",
                    action.red, action.yellow, action.green
                ))
            }
            ControlRequest::IndicatorMode(action) => {
                self.controller.set_mode(action.mode)?;
                Ok(format!("Indicator light mode set to {}", action.mode))
            }
            ControlRequest::Measurement(request) => {
                self.controller.measurement_control(request.action).await?;
                Ok(format!("Distance measurement {} processed", request.action))
            }
        }
    }

    pub fn observe(&self, request: ObserveRequest) -> ControlResponse {
        let targets = request.observe_targets;
        ControlResponse::from_result(self.check_ready().map(|()| {
            let succeeded = self.controller.observe(targets);
            format!(
                "Observe measurements={} parserCommandResponse={} processed with result succeeded={succeeded}",
                targets.measurements, targets.parser_command_response
            )
        }))
    }

    /// Current value of a declared variable.
    pub fn read_variable(&self, browse_name: &str) -> Result<Variant> {
        let binding = self
            .bindings
            .variable(browse_name)
            .ok_or_else(|| Error::UnknownNode(browse_name.to_string()))?;
        let value = self.controller.get(binding.device)?;
        Ok(Variant::from_register(value, &binding.data_type_name))
    }

    /// Writes a declared variable. The value's type must match the declaration.
    pub fn write_variable(&self, browse_name: &str, value: Variant) -> Result<()> {
        let binding = self
            .bindings
            .variable(browse_name)
            .ok_or_else(|| Error::UnknownNode(browse_name.to_string()))?;
        if !binding.writeable {
            return Err(Error::NotWriteable(browse_name.to_string()));
        }
        if value.data_type_name() != binding.data_type_name {
            return Err(Error::DataTypeMismatch {
                node: browse_name.to_string(),
                expected: binding.data_type_name.clone(),
                actual: value.data_type_name(),
            });
        }
        let register = value.to_register(binding.device)?;
        self.controller.set(binding.device, register)
    }

    /// Calls a declared method.
    pub async fn call_method(&self, browse_name: &str, arguments: &[Variant]) -> MethodResult {
        info!("Method call {browse_name}({arguments:?})");
        let result = self.invoke(browse_name, arguments).await;
        if let Err(err) = &result {
            error!("Error in {browse_name}: {err}");
        }
        result.into()
    }

    async fn invoke(&self, browse_name: &str, arguments: &[Variant]) -> Result<()> {
        self.check_ready()?;
        let method = self
            .bindings
            .method(browse_name)
            .ok_or_else(|| Error::UnknownNode(browse_name.to_string()))?;
        let argument = |index: usize| {
            arguments.get(index).ok_or_else(|| {
                Error::InvalidArguments(format!("{browse_name}: missing argument {}", index + 1))
            })
        };
        match method {
            BoundMethod::ControlIndicatorLights => self.controller.set_lamps(
                argument(0)?.as_level()?,
                argument(1)?.as_level()?,
                argument(2)?.as_level()?,
            ),
            BoundMethod::SetIndicatorLightMode => {
                let mode: IndicatorMode = argument(0)?.as_str()?.parse()?;
                self.controller.set_mode(mode)
            }
            BoundMethod::ControlDistanceSensor => {
                let action: MeasurementAction = argument(0)?.as_str()?.parse()?;
                self.controller.measurement_control(action).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetConfig, DeviceConfig, MethodConfig, NodeConfig};
    use crate::gpio::SimulatedGpio;
    use crate::tokio_async::tests::{sensor_reply, spawn_sensor};
    use assert_matches::assert_matches;

    fn node(browse_name: &str, data_type_name: &str, writeable: bool) -> NodeConfig {
        NodeConfig {
            browse_name: browse_name.into(),
            display_name: String::new(),
            description: String::new(),
            sample_interval: None,
            data_type_name: data_type_name.into(),
            value: None,
            writeable,
        }
    }

    fn method(browse_name: &str) -> MethodConfig {
        MethodConfig {
            browse_name: browse_name.into(),
            display_name: String::new(),
            description: String::new(),
            input_arguments: Vec::new(),
            output_arguments: Vec::new(),
        }
    }

    fn asset_root() -> AssetRootConfig {
        AssetRootConfig {
            root_folder_name: "Plc".into(),
            assets: vec![AssetConfig {
                name: "IndicatorLights".into(),
                nodes: vec![
                    node("indicatorLightDeviceRed", "Boolean", true),
                    node("indicatorLightDeviceGreen", "Boolean", false),
                    node("tfLunaDevice", "UInt16", false),
                    node("temperature", "Double", false),
                ],
            }],
            methods: vec![
                method("controlIndicatorLights"),
                method("setIndicatorLightMode"),
                method("controlDistanceSensor"),
                method("reboot"),
            ],
        }
    }

    fn service() -> (PlcService, SimulatedGpio) {
        let gpio = SimulatedGpio::new();
        let controller = DeviceController::new(
            Arc::new(DeviceConfig::with_pins(17, 27, 22)),
            Arc::new(gpio.clone()),
        );
        let service = PlcService::new(controller, AddressBindings::from_config(&asset_root()));
        (service, gpio)
    }

    async fn started() -> (PlcService, SimulatedGpio) {
        let (service, gpio) = service();
        let (client, device) = tokio::io::duplex(256);
        let _sensor_task = spawn_sensor(device, sensor_reply);
        service.start(move |_| Ok(client)).await.unwrap();
        (service, gpio)
    }

    #[test]
    fn bindings_skip_unknown_names() {
        let bindings = AddressBindings::from_config(&asset_root());
        assert_eq!(bindings.root_folder_name(), "Plc");
        assert_eq!(bindings.variables().count(), 3);
        assert!(bindings.variable("temperature").is_none());
        assert_eq!(
            bindings.variable("tfLunaDevice").map(|b| b.device),
            Some(DeviceId::DistanceSensor)
        );
        assert_eq!(
            bindings.method("controlDistanceSensor"),
            Some(BoundMethod::ControlDistanceSensor)
        );
        assert_eq!(bindings.method("reboot"), None);
    }

    #[tokio::test]
    async fn requests_before_initialization_fail() {
        let (service, _gpio) = service();
        let response = service
            .control(ControlRequest::IndicatorMode(IndicatorModeAction {
                mode: IndicatorMode::Auto,
            }))
            .await;
        assert!(!response.succeeded);
        assert!(response.message.contains("not initialized"));

        assert!(!service.observe(ObserveRequest::default()).succeeded);
        assert!(!service.call_method("setIndicatorLightMode", &[]).await.succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn control_requests() {
        let (service, gpio) = started().await;

        let response = service
            .control(ControlRequest::IndicatorLight(IndicatorLightAction {
                red: Level::High,
                yellow: Level::Low,
                green: Level::Low,
            }))
            .await;
        assert!(response.succeeded, "{}", response.message);
        assert_eq!(gpio.level(17), Some(Level::High));
        assert_eq!(
            service.controller().indicator_mode(),
            IndicatorMode::Manual
        );

        let response = service
            .control(ControlRequest::Measurement(MeasurementRequest {
                action: MeasurementAction::Start,
            }))
            .await;
        assert!(response.succeeded, "{}", response.message);
        assert_eq!(service.controller().indicator_mode(), IndicatorMode::Auto);

        gpio.set_available(false);
        let response = service
            .control(ControlRequest::IndicatorMode(IndicatorModeAction {
                mode: IndicatorMode::Green,
            }))
            .await;
        assert!(!response.succeeded);
        assert_eq!(service.controller().indicator_mode(), IndicatorMode::Auto);

        let response = service.observe(ObserveRequest {
            observe_targets: ObserveTargets {
                measurements: true,
                parser_command_response: false,
            },
        });
        assert!(response.succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn method_calls() {
        let (service, gpio) = started().await;
        let mut events = service.subscribe_events();

        let result = service
            .call_method(
                "controlIndicatorLights",
                &[Variant::Boolean(false), Variant::UInt16(1), Variant::Boolean(true)],
            )
            .await;
        assert_eq!(result.message, "Success");
        assert_eq!(gpio.level(27), Some(Level::High));
        assert_eq!(gpio.level(22), Some(Level::High));

        let result = service
            .call_method("setIndicatorLightMode", &[Variant::String("PURPLE".into())])
            .await;
        assert!(!result.succeeded);
        assert!(result.message.contains("PURPLE"));
        assert_eq!(service.controller().indicator_mode(), IndicatorMode::Manual);

        let result = service
            .call_method("setIndicatorLightMode", &[Variant::String("REDFLASHING".into())])
            .await;
        assert!(result.succeeded);
        assert_eq!(
            service.controller().indicator_mode(),
            IndicatorMode::RedFlashing
        );

        let result = service
            .call_method("controlDistanceSensor", &[Variant::String("START".into())])
            .await;
        assert!(result.succeeded, "{}", result.message);
        assert_eq!(events.recv().await.unwrap(), ControllerEvent::MeasurementStarted);

        let result = service.call_method("controlIndicatorLights", &[]).await;
        assert!(!result.succeeded);
        assert!(!service.call_method("reboot", &[]).await.succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn variable_access() {
        let (service, gpio) = started().await;

        assert_eq!(
            service.read_variable("tfLunaDevice").unwrap(),
            Variant::UInt16(0)
        );
        service
            .write_variable("indicatorLightDeviceRed", Variant::Boolean(true))
            .unwrap();
        assert_eq!(gpio.level(17), Some(Level::High));
        assert_eq!(
            service.read_variable("indicatorLightDeviceRed").unwrap(),
            Variant::Boolean(true)
        );

        assert_matches!(
            service.write_variable("indicatorLightDeviceRed", Variant::UInt16(1)),
            Err(Error::DataTypeMismatch { .. })
        );
        assert_matches!(
            service.write_variable("indicatorLightDeviceGreen", Variant::Boolean(true)),
            Err(Error::NotWriteable(_))
        );
        assert_matches!(
            service.read_variable("temperature"),
            Err(Error::UnknownNode(_))
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn control_request_payloads() {
        let request: ControlRequest = serde_yaml::from_str(
            r#"{"action": "INDICATORLIGHT", "data": {"ledRedState": 1, "ledYellowState": 0, "ledGreenState": 0}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            ControlRequest::IndicatorLight(IndicatorLightAction {
                red: Level::High,
                yellow: Level::Low,
                green: Level::Low,
            })
        );

        let request: ControlRequest =
            serde_yaml::from_str(r#"{"action": "INDICATORMODE", "data": {"mode": "YELLOWFLASHING"}}"#)
                .unwrap();
        assert_eq!(
            request,
            ControlRequest::IndicatorMode(IndicatorModeAction {
                mode: IndicatorMode::YellowFlashing
            })
        );

        let request: ControlRequest =
            serde_yaml::from_str(r#"{"action": "MEASUREMENT", "data": {"action": "STOP"}}"#)
                .unwrap();
        assert_eq!(
            request,
            ControlRequest::Measurement(MeasurementRequest {
                action: MeasurementAction::Stop
            })
        );

        assert!(serde_yaml::from_str::<ControlRequest>(
            r#"{"action": "INDICATORMODE", "data": {"mode": "BLUE"}}"#
        )
        .is_err());

        let observe: ObserveRequest = serde_yaml::from_str(
            r#"{"observeTargets": {"measurements": true, "parserCommandResponse": false}}"#,
        )
        .unwrap();
        assert!(observe.observe_targets.measurements);
    }
}

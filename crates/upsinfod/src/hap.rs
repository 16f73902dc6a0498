//! Accessory services and characteristics.
//!
//! A minimal in-process model of the HomeKit accessory layer: a service holds
//! a set of characteristics, each of which can be read on demand through a
//! registered getter and pushed through `update_characteristic`. Pushed
//! values are broadcast to subscribers so a bridge can forward them.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Buffered updates per subscriber before old ones are dropped
const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Battery,
    HumiditySensor,
}

impl ServiceKind {
    /// Short HAP service type code
    pub fn hap_type(&self) -> u16 {
        match self {
            ServiceKind::Battery => 0x96,
            ServiceKind::HumiditySensor => 0x82,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Characteristic {
    BatteryLevel,
    StatusLowBattery,
    ChargingState,
    CurrentRelativeHumidity,
}

impl Characteristic {
    /// Short HAP characteristic type code
    pub fn hap_type(&self) -> u16 {
        match self {
            Characteristic::BatteryLevel => 0x68,
            Characteristic::StatusLowBattery => 0x79,
            Characteristic::ChargingState => 0x8F,
            Characteristic::CurrentRelativeHumidity => 0x10,
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Characteristic::BatteryLevel => "BatteryLevel",
            Characteristic::StatusLowBattery => "StatusLowBattery",
            Characteristic::ChargingState => "ChargingState",
            Characteristic::CurrentRelativeHumidity => "CurrentRelativeHumidity",
        };
        f.write_str(name)
    }
}

/// HAP `ChargingState` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingState {
    NotCharging = 0,
    Charging = 1,
    NotChargeable = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CharacteristicValue {
    Int(i64),
    Bool(bool),
    Float(f64),
}

impl From<ChargingState> for CharacteristicValue {
    fn from(state: ChargingState) -> Self {
        CharacteristicValue::Int(state as i64)
    }
}

impl fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacteristicValue::Int(v) => write!(f, "{}", v),
            CharacteristicValue::Bool(v) => write!(f, "{}", v),
            CharacteristicValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// A value pushed to a characteristic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacteristicUpdate {
    pub service: String,
    pub characteristic: Characteristic,
    pub value: CharacteristicValue,
}

pub type GetHandler = Box<dyn Fn() -> CharacteristicValue + Send + Sync>;

pub struct Service {
    kind: ServiceKind,
    name: String,
    getters: RwLock<HashMap<Characteristic, GetHandler>>,
    values: RwLock<HashMap<Characteristic, CharacteristicValue>>,
    updates: broadcast::Sender<CharacteristicUpdate>,
}

impl Service {
    pub fn new(kind: ServiceKind, name: impl Into<String>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            kind,
            name: name.into(),
            getters: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
            updates,
        })
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the pull getter for a characteristic, replacing any previous one
    pub fn on_get<F>(&self, characteristic: Characteristic, handler: F)
    where
        F: Fn() -> CharacteristicValue + Send + Sync + 'static,
    {
        self.getters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(characteristic, Box::new(handler));
    }

    /// Read a characteristic: getter first, last pushed value otherwise
    pub fn get(&self, characteristic: Characteristic) -> Option<CharacteristicValue> {
        let getters = self.getters.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = getters.get(&characteristic) {
            return Some(handler());
        }
        drop(getters);
        self.last_value(characteristic)
    }

    pub fn last_value(&self, characteristic: Characteristic) -> Option<CharacteristicValue> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&characteristic)
            .copied()
    }

    /// Push a new value to subscribers
    pub fn update_characteristic(
        &self,
        characteristic: Characteristic,
        value: impl Into<CharacteristicValue>,
    ) {
        let value = value.into();
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(characteristic, value);

        // No subscribers is fine, the value is still cached
        let _ = self.updates.send(CharacteristicUpdate {
            service: self.name.clone(),
            characteristic,
            value,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CharacteristicUpdate> {
        self.updates.subscribe()
    }

    /// Characteristics with a registered getter
    pub fn characteristics(&self) -> Vec<Characteristic> {
        let mut list: Vec<Characteristic> = self
            .getters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        list.sort_by_key(|c| c.hap_type());
        list
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("characteristics", &self.characteristics())
            .finish()
    }
}

impl From<i64> for CharacteristicValue {
    fn from(v: i64) -> Self {
        CharacteristicValue::Int(v)
    }
}

impl From<bool> for CharacteristicValue {
    fn from(v: bool) -> Self {
        CharacteristicValue::Bool(v)
    }
}

impl From<f64> for CharacteristicValue {
    fn from(v: f64) -> Self {
        CharacteristicValue::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn test_getter_is_called_on_each_read() {
        let service = Service::new(ServiceKind::Battery, "UPS");
        let level = Arc::new(AtomicI64::new(80));
        let source = Arc::clone(&level);
        service.on_get(Characteristic::BatteryLevel, move || {
            CharacteristicValue::Int(source.load(Ordering::SeqCst))
        });

        assert_eq!(service.get(Characteristic::BatteryLevel), Some(CharacteristicValue::Int(80)));
        level.store(12, Ordering::SeqCst);
        assert_eq!(service.get(Characteristic::BatteryLevel), Some(CharacteristicValue::Int(12)));
    }

    #[test]
    fn test_get_falls_back_to_pushed_value() {
        let service = Service::new(ServiceKind::HumiditySensor, "UPS Load");
        assert_eq!(service.get(Characteristic::CurrentRelativeHumidity), None);
        service.update_characteristic(Characteristic::CurrentRelativeHumidity, 14.5);
        assert_eq!(
            service.get(Characteristic::CurrentRelativeHumidity),
            Some(CharacteristicValue::Float(14.5))
        );
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let service = Service::new(ServiceKind::Battery, "UPS");
        let mut rx = service.subscribe();
        service.update_characteristic(Characteristic::StatusLowBattery, true);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.service, "UPS");
        assert_eq!(update.characteristic, Characteristic::StatusLowBattery);
        assert_eq!(update.value, CharacteristicValue::Bool(true));
    }

    #[test]
    fn test_charging_state_value() {
        assert_eq!(
            CharacteristicValue::from(ChargingState::NotCharging),
            CharacteristicValue::Int(0)
        );
    }

    #[test]
    fn test_characteristics_listed_in_type_order() {
        let service = Service::new(ServiceKind::Battery, "UPS");
        service.on_get(Characteristic::ChargingState, || ChargingState::NotCharging.into());
        service.on_get(Characteristic::BatteryLevel, || CharacteristicValue::Int(100));
        service.on_get(Characteristic::StatusLowBattery, || CharacteristicValue::Bool(false));
        assert_eq!(
            service.characteristics(),
            vec![
                Characteristic::BatteryLevel,
                Characteristic::StatusLowBattery,
                Characteristic::ChargingState,
            ]
        );
    }
}

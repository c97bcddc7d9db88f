//! Advertisement sources.
//!
//! A session finds its lock through an [`AdvertisementSource`]. While the
//! session is scanning it holds one subscription; dropping the receiver ends
//! the subscription and stops the underlying scan.
//!
//! [`BtleplugScanner`] is the native implementation. Hosts that already run
//! their own scanner can instead push advertisements into
//! [`DeviceSession::on_advertisement`](crate::session::DeviceSession::on_advertisement).

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sesame_types::DeviceAddress;

use crate::advertisement::Advertisement;
use crate::error::{Error, Result};

/// Default buffer of a scan subscription.
pub const DEFAULT_SCAN_BUFFER: usize = 32;

/// Source of advertisements.
#[async_trait]
pub trait AdvertisementSource: Send + Sync {
    /// Whether `address` has been seen recently and is connectable.
    async fn is_present(&self, address: DeviceAddress) -> bool;

    /// Start receiving advertisements.
    ///
    /// Scanning continues until the returned receiver is dropped.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Advertisement>>;
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or_else(|| {
        Error::Bluetooth(btleplug::Error::NotSupported(
            "no Bluetooth adapter available".to_string(),
        ))
    })
}

/// Build an [`Advertisement`] from peripheral properties.
pub fn advertisement_from_properties(props: &PeripheralProperties) -> Result<Advertisement> {
    let address: DeviceAddress = props.address.to_string().parse()?;
    Ok(Advertisement {
        address,
        rssi: props.rssi,
        manufacturer_data: props.manufacturer_data.clone(),
        services: props.services.clone(),
    })
}

/// Active scanner on a btleplug adapter.
#[derive(Debug, Clone)]
pub struct BtleplugScanner {
    adapter: Adapter,
    buffer: usize,
}

impl BtleplugScanner {
    /// Use the first available adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            buffer: DEFAULT_SCAN_BUFFER,
        }
    }

    /// Set the subscription buffer size.
    #[must_use]
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = adapter.peripheral(id).await.ok()?;
        let props = peripheral.properties().await.ok()??;
        match advertisement_from_properties(&props) {
            Ok(adv) => Some(adv),
            Err(e) => {
                debug!("Skipping peripheral with unusable address: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl AdvertisementSource for BtleplugScanner {
    async fn is_present(&self, address: DeviceAddress) -> bool {
        let Ok(peripherals) = self.adapter.peripherals().await else {
            return false;
        };
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await
                && props.address.to_string().parse::<DeviceAddress>().ok() == Some(address)
            {
                return true;
            }
        }
        false
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Advertisement>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Started BLE scan");

        let (tx, rx) = mpsc::channel(self.buffer);
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => {
                        let id = match event {
                            Some(CentralEvent::DeviceDiscovered(id))
                            | Some(CentralEvent::DeviceUpdated(id))
                            | Some(CentralEvent::ManufacturerDataAdvertisement { id, .. }) => id,
                            Some(_) => continue,
                            None => break,
                        };
                        if let Some(adv) = Self::advertisement_for(&adapter, &id).await
                            && tx.send(adv).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            } else {
                info!("Stopped BLE scan");
            }
        });

        Ok(rx)
    }
}

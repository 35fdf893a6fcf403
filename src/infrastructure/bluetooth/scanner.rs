//! BLE Scanner Module
//!
//! Collects peripherals reported by the transport during a scan and keeps
//! the list the caller picks a device from.

use crate::domain::models::{AppEvent, DiscoveredDevice, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::transport::{ScanFilter, Transport, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct BleScanner {
    receiver: Option<mpsc::UnboundedReceiver<DiscoveredDevice>>,
    devices: Vec<DiscoveredDevice>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            receiver: None,
            devices: Vec::new(),
            event_sender,
        }
    }

    /// Start scanning. Any previous scan is stopped and its results
    /// discarded.
    pub async fn start(
        &mut self,
        transport: &dyn Transport,
        filter: ScanFilter,
    ) -> Result<(), TransportError> {
        // Stop any existing scan
        if self.receiver.is_some() {
            self.stop(transport).await?;
        }
        self.devices.clear();

        info!("Starting BLE scan (filter: {:?})", filter.service_uuids);
        let receiver = transport.scan(filter).await?;
        self.receiver = Some(receiver);
        self.send_log("Scanning for devices...", MessageSeverity::Info);

        Ok(())
    }

    /// Stop scanning and return the names of the devices found.
    pub async fn stop(&mut self, transport: &dyn Transport) -> Result<Vec<String>, TransportError> {
        if let Some(mut receiver) = self.receiver.take() {
            info!("Stopping BLE scan...");
            transport.stop_scan().await?;

            while let Ok(device) = receiver.try_recv() {
                self.record(device);
            }

            self.send_log(
                &format!("Scan stopped, {} device(s) found.", self.devices.len()),
                MessageSeverity::Info,
            );
        }
        Ok(self.device_names())
    }

    // Only named devices are offered, once each, in discovery order.
    fn record(&mut self, device: DiscoveredDevice) {
        let named = device.name.as_deref().is_some_and(|n| !n.is_empty());
        if !named || self.devices.iter().any(|d| d.handle == device.handle) {
            return;
        }
        debug!("Found device {} ({})", device.name.as_deref().unwrap_or(""), device.handle);
        self.devices.push(device);
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().filter_map(|d| d.name.clone()).collect()
    }

    pub fn find_by_index(&self, index: usize) -> Option<&DiscoveredDevice> {
        self.devices.get(index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.name.as_deref() == Some(name))
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceHandle;
    use crate::infrastructure::bluetooth::simulator::SimulatedTransport;

    fn device(id: &str, name: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            handle: DeviceHandle(id.to_string()),
            name: name.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_scan_keeps_named_unique_devices() {
        let transport = SimulatedTransport::new();
        transport.add_peripheral(device("aa", Some("JDY-23A-BLE")));
        transport.add_peripheral(device("bb", None));
        transport.add_peripheral(device("cc", Some("")));
        transport.add_peripheral(device("dd", Some("Speaker")));
        transport.add_peripheral(device("aa", Some("JDY-23A-BLE")));

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scanner = BleScanner::new(tx);
        scanner.start(&transport, ScanFilter::default()).await.unwrap();
        assert!(scanner.is_scanning());

        let names = scanner.stop(&transport).await.unwrap();
        assert_eq!(names, vec!["JDY-23A-BLE", "Speaker"]);
        assert!(!scanner.is_scanning());
        assert_eq!(scanner.find_by_index(1).unwrap().handle.0, "dd");
        assert_eq!(scanner.find_by_name("JDY-23A-BLE").unwrap().handle.0, "aa");
        assert!(scanner.find_by_name("Nope").is_none());
    }

    #[tokio::test]
    async fn test_restart_clears_previous_results() {
        let transport = SimulatedTransport::new();
        transport.add_peripheral(device("aa", Some("Robot")));

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scanner = BleScanner::new(tx);
        scanner.start(&transport, ScanFilter::default()).await.unwrap();
        scanner.stop(&transport).await.unwrap();
        assert_eq!(scanner.devices().len(), 1);

        transport.remove_peripherals();
        scanner.start(&transport, ScanFilter::default()).await.unwrap();
        assert!(scanner.devices().is_empty());
        assert!(scanner.stop(&transport).await.unwrap().is_empty());
    }
}

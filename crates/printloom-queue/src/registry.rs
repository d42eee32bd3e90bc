//! One live adapter per printer.

use std::sync::Arc;

use dashmap::DashMap;
use printloom_core::{AdapterFactory, Printer, PrinterAdapter};

/// Adapters keyed by printer ID.
pub struct AdapterRegistry {
    factory: Arc<dyn AdapterFactory>,
    adapters: DashMap<String, Arc<dyn PrinterAdapter>>,
}

impl AdapterRegistry {
    /// Registry that builds adapters with `factory`.
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            factory,
            adapters: DashMap::new(),
        }
    }

    /// Adapter for `printer`, created on first use.
    pub fn get_or_create(&self, printer: &Printer) -> Option<Arc<dyn PrinterAdapter>> {
        if let Some(adapter) = self.get(&printer.id) {
            return Some(adapter);
        }
        if !self.factory.supports(printer.adapter_type) {
            tracing::warn!(printer_id = %printer.id, adapter = ?printer.adapter_type, "Unsupported adapter type");
            return None;
        }
        let adapter = self.factory.create(printer)?;
        let entry = self.adapters.entry(printer.id.clone()).or_insert(adapter);
        Some(entry.value().clone())
    }

    /// Existing adapter for a printer.
    pub fn get(&self, printer_id: &str) -> Option<Arc<dyn PrinterAdapter>> {
        self.adapters.get(printer_id).map(|entry| entry.value().clone())
    }

    /// Drop a printer's adapter, disconnecting it.
    pub async fn remove(&self, printer_id: &str) {
        let removed = self.adapters.remove(printer_id);
        if let Some((_, adapter)) = removed {
            adapter.disconnect().await;
        }
    }

    /// Disconnect every adapter.
    pub async fn disconnect_all(&self) {
        let adapters: Vec<Arc<dyn PrinterAdapter>> =
            self.adapters.iter().map(|entry| entry.value().clone()).collect();
        for adapter in adapters {
            adapter.disconnect().await;
        }
    }
}

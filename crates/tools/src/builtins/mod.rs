//! Built-in tool implementations.

mod energy;

pub use energy::{
    BackendClient, DeviceConsumptionTool, DeviceDetailsTool, EnergySuggestionsTool,
    EnergyUsageSummaryTool, PredictedBillTool, ToolFetchError, WeatherTool,
};

use ampere_config::BackendConfig;

use crate::ToolRegistry;

// ── Convenience: create a registry with every energy tool ────────────────────

pub fn default_registry(config: &BackendConfig) -> ToolRegistry {
    let backend = BackendClient::new(config);
    let mut registry = ToolRegistry::default();

    registry.register(Box::new(EnergyUsageSummaryTool { backend: backend.clone() }));
    registry.register(Box::new(DeviceConsumptionTool { backend: backend.clone() }));
    registry.register(Box::new(PredictedBillTool { backend: backend.clone() }));
    registry.register(Box::new(DeviceDetailsTool { backend: backend.clone() }));
    registry.register(Box::new(EnergySuggestionsTool { backend: backend.clone() }));
    registry.register(Box::new(WeatherTool { backend }));

    registry
}

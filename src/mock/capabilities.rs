//! What the simulated controller claims to be and which functions it serves.

use crate::protocol::FunctionType;

/// Returns the functions a default simulated controller supports.
#[must_use]
pub fn default_supported_function_types() -> Vec<FunctionType> {
    vec![
        FunctionType::SendData,
        FunctionType::SendDataAbort,
        FunctionType::SoftReset,
    ]
}

/// Identity and supported functions of a simulated controller.
///
/// Requests for functions missing from `supported_function_types` are
/// recorded but never answered, like a controller whose firmware lacks them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockControllerCapabilities {
    pub firmware_version: String,
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    pub supported_function_types: Vec<FunctionType>,
}

impl MockControllerCapabilities {
    /// Returns true if the controller answers `function`.
    #[must_use]
    pub fn supports(&self, function: FunctionType) -> bool {
        self.supported_function_types.contains(&function)
    }

    /// Removes `function` from the supported set.
    #[must_use]
    pub fn without(mut self, function: FunctionType) -> Self {
        self.supported_function_types.retain(|f| *f != function);
        self
    }
}

impl Default for MockControllerCapabilities {
    fn default() -> Self {
        Self {
            firmware_version: "1.0".into(),
            manufacturer_id: 0xffff,
            product_type: 0xffff,
            product_id: 0xfffe,
            supported_function_types: default_supported_function_types(),
        }
    }
}

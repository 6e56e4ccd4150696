//! Branding Constants
//!
//! Single source of truth for product naming and branding.

/// Product display name
pub const PRODUCT_NAME: &str = "Sidecar";

/// Binary executable name
pub const BIN_NAME: &str = "sidecar";

/// Node link scheme (e.g., sidecar://PEER_ID)
pub const LINK_SCHEME: &str = "sidecar";

/// Short description
pub const DESCRIPTION: &str = "Binding-Driven Overlay TCP Forwarder";

// =============================================================================
// Protection — SL/TP placement and the guardian that keeps them alive
// =============================================================================

pub mod guardian;
pub mod placer;

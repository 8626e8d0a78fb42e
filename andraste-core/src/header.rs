pub mod pe;

pub trait Header: std::fmt::Debug + Send + Sync {
    /// Returns the machine architecture identifier.
    fn machine(&self) -> u16;

    /// Returns the raw characteristics bitfield.
    fn characteristics(&self) -> u16;

    /// Returns a short human-readable name, e.g. "PE".
    fn format_name(&self) -> &'static str;

    /// Returns true if the binary may use more than 2GB of address space.
    fn is_large_address_aware(&self) -> bool;

    /// Returns true if the large-address-aware patch applies to this binary.
    fn is_patchable(&self) -> bool;
}

/// Types implementing WireSerialisable can be written back to a client over
/// the command connection.
pub trait WireSerialisable {
    /// Converts the value in question to a complete reply line (or lines),
    /// including the trailing CRLF.
    fn serialise_wire(&self) -> Vec<u8>;
}

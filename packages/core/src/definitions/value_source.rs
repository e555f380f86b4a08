/// Where a command-class implementation's new value came from. Mirroring
/// between paired impls only ever reacts to Unit and Driver sources; a
/// Program-sourced change is itself the result of mirroring and must not
/// trigger another round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Decoded from a frame the unit sent.
    Unit,
    /// The host wrote the owning field.
    Driver,
    /// Another impl in the same unit pushed the value across.
    Program,
}

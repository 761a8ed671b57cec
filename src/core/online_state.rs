/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// No attempt to connect has completed yet.
    #[default]
    Unknown,
    Online,
    /// Connection attempts failed or the network was disabled; snapshots
    /// are raised from cache.
    Offline,
}

/// Producer side of the change channel. The storage layer calls this once
/// per committed mutation; the bridge only ever consumes what it emits.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, channel: &str, payload: &str);
}


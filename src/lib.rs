pub mod channel;
pub mod config;
pub mod events;
pub mod link;
pub mod net;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod subscriber;
pub mod test_util;
pub mod wire;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}

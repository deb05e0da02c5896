mod connectivity_probe;
mod outbound_queue_flush;

pub(crate) use connectivity_probe::ConnectivityProbe;
pub(crate) use outbound_queue_flush::OutboundQueueFlush;

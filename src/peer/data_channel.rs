use crate::peer::transport::{TransportEvent, TransportEventKind, TransportEvents};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Forward the channel's open/close/message callbacks as transport events
/// of session `epoch`.
pub fn attach_dc(dc: &Arc<RTCDataChannel>, epoch: u64, events: TransportEvents) {
    debug!(label = dc.label(), epoch, "attaching data channel");

    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        debug!(epoch, "data channel open");
        forward(&open_events, epoch, TransportEventKind::ChannelOpen);
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(frame) => forward(
                &message_events,
                epoch,
                TransportEventKind::ChannelMessage(frame),
            ),
            Err(_) => warn!(len = msg.data.len(), "non-UTF-8 frame dropped"),
        }
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        debug!(epoch, "data channel closed");
        forward(&events, epoch, TransportEventKind::ChannelClosed);
        Box::pin(async {})
    }));
}

pub(crate) fn forward(events: &TransportEvents, epoch: u64, kind: TransportEventKind) {
    if events.send(TransportEvent { epoch, kind }).is_err() {
        debug!(epoch, "negotiation loop gone, transport event dropped");
    }
}

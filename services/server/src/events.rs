//! Fleet event loop: session lifecycle and playback-ended notifications
//! funnel here, where registry bookkeeping, queue auto-advance, and
//! lifecycle handlers are applied in one place.

use crate::dispatch::Dispatcher;
use crate::session::FleetEvent;
use bw_core::handlers::events;
use tokio::sync::mpsc;

pub async fn run_fleet_events(dispatcher: Dispatcher, mut rx: mpsc::Receiver<FleetEvent>) {
    while let Some(event) = rx.recv().await {
        let state = &dispatcher.state;
        match event {
            FleetEvent::Connected { .. } => {
                dispatcher.run_event_handlers(events::SERVER_CONNECT).await;
            }
            FleetEvent::Disconnected { client_id, serial } => {
                // A reconnect may have replaced the entry already; only the
                // session that actually died gets to remove it.
                if let Some(client) = state.registry.remove_if_serial(&client_id, serial).await {
                    state
                        .logfan
                        .warn(format!("Client {} disconnected", client.info.display_name()));
                    dispatcher
                        .run_event_handlers(events::SERVER_DISCONNECT)
                        .await;
                }
            }
            FleetEvent::BroadcastEnded { client_id } => {
                let mut queue = state.queue.lock().await;
                queue.on_broadcast_ended(state, &client_id).await;
            }
            FleetEvent::WsJoined => {
                dispatcher.run_event_handlers(events::SERVER_WS_JOIN).await;
            }
            FleetEvent::WsLeft => {
                dispatcher.run_event_handlers(events::SERVER_WS_LEAVE).await;
            }
        }
    }
}

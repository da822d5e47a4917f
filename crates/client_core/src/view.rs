use std::sync::Arc;

use shared::protocol::FeedEvent;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::SeatApi,
    config::Settings,
    feed::{FeedCallbacks, FeedConnector, FeedStatus, SeatFeed, TungsteniteConnector},
    reservation::{ReservationController, SeatScope},
};

pub struct SeatView {
    controller: Arc<ReservationController>,
    feed: SeatFeed,
    pump: JoinHandle<()>,
}

impl SeatView {
    pub async fn mount(
        api: Arc<dyn SeatApi>,
        viewer: impl Into<String>,
        settings: &Settings,
        scope: SeatScope,
    ) -> Self {
        Self::mount_with_connector(api, viewer, settings, scope, || TungsteniteConnector).await
    }

    // Feed first, then fetch, so no delta sent in between is lost.
    pub async fn mount_with_connector<C, F>(
        api: Arc<dyn SeatApi>,
        viewer: impl Into<String>,
        settings: &Settings,
        scope: SeatScope,
        connector: F,
    ) -> Self
    where
        C: FeedConnector + 'static,
        F: FnOnce() -> C + Send + 'static,
    {
        let controller = ReservationController::new(api, viewer, settings, scope);
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = SeatFeed::mount_with_connector(settings, FeedCallbacks::forwarding(tx), connector);
        let pump = spawn_pump(Arc::clone(&controller), rx);

        if let Err(err) = controller.refresh_seats().await {
            warn!(error = %err, "view: initial seat list unavailable");
        }
        info!(viewer = controller.viewer(), ?scope, "view: mounted");

        Self {
            controller,
            feed,
            pump,
        }
    }

    pub fn controller(&self) -> &Arc<ReservationController> {
        &self.controller
    }

    pub fn feed_status(&self) -> watch::Receiver<FeedStatus> {
        self.feed.status()
    }

    pub async fn unmount(self) {
        self.controller.unmount().await;
        self.feed.unmount().await;
        self.pump.abort();
        info!("view: unmounted");
    }
}

fn spawn_pump(
    controller: Arc<ReservationController>,
    mut rx: mpsc::UnboundedReceiver<FeedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !controller.is_mounted() {
                break;
            }
            match event {
                FeedEvent::SeatUpdated(update) => controller.apply_feed_update(&update).await,
                FeedEvent::Refresh { released } => {
                    if let Err(err) = controller.handle_refresh_signal(released).await {
                        debug!(error = %err, "view: refresh after feed signal failed");
                    }
                }
            }
        }
        debug!("view: feed pump finished");
    })
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;

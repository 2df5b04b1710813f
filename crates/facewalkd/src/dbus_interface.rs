use crate::orchestrator::Orchestrator;
use crate::presence::Presence;
use crate::resolver::ResolveError;
use facewalk_core::IdentityHash;
use futures::StreamExt;
use std::sync::Arc;
use zbus::interface;
use zbus::message::Header;
use zbus::names::UniqueName;

pub const BUS_NAME: &str = "org.freedesktop.FaceWalk1";
pub const OBJECT_PATH: &str = "/org/freedesktop/FaceWalk1";

/// D-Bus interface for the FaceWalk daemon.
///
/// Bus name: org.freedesktop.FaceWalk1
/// Object path: /org/freedesktop/FaceWalk1
pub struct FaceWalkService {
    orchestrator: Arc<Orchestrator>,
    presence: Presence,
}

impl FaceWalkService {
    pub fn new(orchestrator: Arc<Orchestrator>, presence: Presence) -> Self {
        Self {
            orchestrator,
            presence,
        }
    }
}

fn to_fdo(err: ResolveError) -> zbus::fdo::Error {
    match err {
        ResolveError::Registry(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        ResolveError::Locator(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.freedesktop.FaceWalk1")]
impl FaceWalkService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": self.orchestrator.state(),
            "extraction": self.orchestrator.extraction_progress(),
            "identities": self.orchestrator.identity_count(),
            "interactive_clients": self.presence.active(),
        })
        .to_string())
    }

    /// List face albums as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.orchestrator.identities().await;
        serde_json::to_string(&identities).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Fold `source` into `target`. Returns the number of feature records rewritten.
    async fn merge_identities(&self, target: &str, source: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(target, source, "merge_identities requested");
        let report = self
            .orchestrator
            .merge_identities(&IdentityHash::from(target), &IdentityHash::from(source))
            .await
            .map_err(to_fdo)?;
        Ok(u32::try_from(report.features_rewritten).unwrap_or(u32::MAX))
    }

    /// Remove one face instance (by its face-album section key) from a face album.
    async fn erase_face(&self, face_album: &str, face_key: &str) -> zbus::fdo::Result<()> {
        tracing::info!(face_album, "erase_face requested");
        self.orchestrator
            .erase_face(face_album, face_key)
            .await
            .map_err(to_fdo)
    }

    /// Register an interactive client; background extraction pauses until it
    /// detaches or its connection leaves the bus.
    async fn attach_client(&self, #[zbus(header)] header: Header<'_>) -> zbus::fdo::Result<u64> {
        let sender = header.sender().map(UniqueName::as_str);
        let id = self.presence.attach_session(sender);
        tracing::info!(session = id, sender = ?sender, "interactive client attached");
        Ok(id)
    }

    async fn detach_client(&self, session: u64) -> zbus::fdo::Result<bool> {
        let detached = self.presence.detach_session(session);
        tracing::info!(session, detached, "interactive client detached");
        Ok(detached)
    }
}

/// Claim the bus name on the session bus and serve the interface.
pub async fn serve(orchestrator: Arc<Orchestrator>, presence: Presence) -> zbus::Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceWalkService::new(orchestrator, presence.clone()))?
        .build()
        .await?;
    watch_departures(&connection, presence).await?;
    Ok(connection)
}

/// Unique connection name that just left the bus, if this owner change is one.
fn departed_client<'a>(name: &'a str, new_owner: Option<&str>) -> Option<&'a str> {
    let gone = new_owner.map_or(true, str::is_empty);
    (gone && name.starts_with(':')).then_some(name)
}

/// Release the sessions of clients that disconnect without detaching.
async fn watch_departures(connection: &zbus::Connection, presence: Presence) -> zbus::Result<()> {
    let dbus = zbus::fdo::DBusProxy::new(connection).await?;
    let mut changes = dbus.receive_name_owner_changed().await?;
    tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            let Ok(args) = change.args() else {
                continue;
            };
            let new_owner: &Option<UniqueName<'_>> = args.new_owner();
            let Some(client) = departed_client(args.name().as_str(), new_owner.as_ref().map(UniqueName::as_str)) else {
                continue;
            };
            let released = presence.release_owner(client);
            if released > 0 {
                tracing::info!(sender = client, released, "interactive client left the bus");
            }
        }
        tracing::debug!("name owner stream closed");
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_departed_client_only_for_vanished_unique_names() {
        assert_eq!(departed_client(":1.42", None), Some(":1.42"));
        assert_eq!(departed_client(":1.42", Some("")), Some(":1.42"));
        assert_eq!(departed_client(":1.42", Some(":1.42")), None);
        assert_eq!(departed_client("org.example.Other", None), None);
    }

    #[tokio::test]
    async fn test_departure_releases_held_sessions() {
        let presence = Presence::new();
        let sender = ":1.9";
        presence.attach_session(Some(sender));
        assert_eq!(presence.active(), 1);

        let client = departed_client(sender, None).unwrap();
        assert_eq!(presence.release_owner(client), 1);
        presence.wait_idle().await;
        assert_eq!(presence.active(), 0);
    }
}

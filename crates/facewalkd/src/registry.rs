//! Identity registry: identity hash → face album, contact, members and counts.

use chrono::Utc;
use facewalk_core::{Contact, FaceAlbum, IdentityHash, MediaRef};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityHash),
    #[error("unknown face album: {0}")]
    UnknownAlbum(String),
    #[error("cannot merge identity {0} into itself")]
    SelfMerge(IdentityHash),
}

/// What a merge moved from the source identity.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Face instances counted for the source since the pass started.
    pub moved_faces: usize,
    /// Face album the source hash belonged to before the merge.
    pub source_album: FaceAlbum,
    /// Whether that face album was dropped because it became empty.
    pub source_album_removed: bool,
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    albums: BTreeMap<String, FaceAlbum>,
    by_hash: HashMap<IdentityHash, String>,
    contacts: HashMap<String, Contact>,
    members: HashMap<IdentityHash, BTreeSet<MediaRef>>,
}

fn placeholder_name() -> String {
    format!("Unknown person added on {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.albums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.albums.is_empty()
    }

    /// Register a contact found in album metadata.
    ///
    /// Contacts whose names normalize to the same string share one face album.
    /// A hash already known to the registry keeps its current album.
    pub fn import_contact(&mut self, hash: IdentityHash, contact: Contact) -> &FaceAlbum {
        let key = match self.by_hash.get(&hash) {
            Some(key) if self.albums.contains_key(key) => key.clone(),
            _ => contact.album_key(),
        };
        self.insert(key, hash, contact)
    }

    fn insert(&mut self, key: String, hash: IdentityHash, contact: Contact) -> &FaceAlbum {
        let album = self.albums.entry(key.clone()).or_insert_with(|| FaceAlbum {
            key: key.clone(),
            name: contact.display_name(),
            hashes: Vec::new(),
            count: 0,
        });
        if !album.hashes.contains(&hash) {
            album.hashes.push(hash.clone());
        }
        self.contacts.entry(key.clone()).or_insert(contact);
        self.by_hash.insert(hash, key);
        album
    }

    /// Mint a new identity with its own face album.
    ///
    /// Without a seed name the contact gets a dated placeholder name. A name
    /// that collides with an existing face album gets the hash appended, in
    /// the contact itself so the split survives a reload from `Contacts2`.
    pub fn create_identity(&mut self, seed_name: Option<&str>) -> IdentityHash {
        let hash = IdentityHash::generate();
        let mut contact = Contact::named(seed_name.map(str::to_string).unwrap_or_else(placeholder_name));
        if self.albums.contains_key(&contact.album_key()) {
            contact.original_name = format!("{} ({hash})", contact.original_name);
        }
        let key = contact.album_key();
        tracing::info!(hash = %hash, album = %key, "creating new identity");
        self.insert(key, hash.clone(), contact);
        hash
    }

    pub fn by_hash(&self, hash: &IdentityHash) -> Option<&FaceAlbum> {
        self.by_hash.get(hash).and_then(|key| self.albums.get(key))
    }

    pub fn by_key(&self, key: &str) -> Option<&FaceAlbum> {
        self.albums.get(key)
    }

    pub fn contact_for(&self, hash: &IdentityHash) -> Option<&Contact> {
        self.by_hash.get(hash).and_then(|key| self.contacts.get(key))
    }

    /// Every face album, ordered by key.
    pub fn get_all(&self) -> Vec<FaceAlbum> {
        self.albums.values().cloned().collect()
    }

    #[cfg(test)]
    pub fn members(&self, hash: &IdentityHash) -> Vec<MediaRef> {
        self.members
            .get(hash)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Zero every count and forget members; reconciliation rebuilds both.
    pub fn reset_counts(&mut self) {
        for album in self.albums.values_mut() {
            album.count = 0;
        }
        self.members.clear();
    }

    /// Count one face instance of `hash` in `media`. Unknown hashes are ignored.
    pub fn record_face(&mut self, hash: &IdentityHash, media: &MediaRef) -> Option<&FaceAlbum> {
        let key = self.by_hash.get(hash)?;
        let album = self.albums.get_mut(key)?;
        album.count += 1;
        self.members.entry(hash.clone()).or_default().insert(media.clone());
        Some(album)
    }

    /// Fold `source` into `target`.
    ///
    /// The source hash stays resolvable and points at the target's album.
    pub fn merge(&mut self, target: &IdentityHash, source: &IdentityHash) -> Result<MergeOutcome, RegistryError> {
        if target == source {
            return Err(RegistryError::SelfMerge(source.clone()));
        }
        let target_key = self
            .by_hash
            .get(target)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownIdentity(target.clone()))?;
        let source_key = self
            .by_hash
            .get(source)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownIdentity(source.clone()))?;
        let source_album = self
            .albums
            .get(&source_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAlbum(source_key.clone()))?;

        let moved = self.members.remove(source).unwrap_or_default();
        let moved_count = moved.len();
        self.members.entry(target.clone()).or_default().extend(moved.iter().cloned());

        let mut source_album_removed = false;
        if source_key != target_key {
            if let Some(album) = self.albums.get_mut(&source_key) {
                album.hashes.retain(|h| h != source);
                album.count = album.count.saturating_sub(moved_count);
                if album.hashes.is_empty() {
                    self.albums.remove(&source_key);
                    self.contacts.remove(&source_key);
                    source_album_removed = true;
                }
            }
            if let Some(album) = self.albums.get_mut(&target_key) {
                album.count += moved_count;
            }
        } else if let Some(album) = self.albums.get_mut(&target_key) {
            album.hashes.retain(|h| h != source);
        }
        self.by_hash.insert(source.clone(), target_key.clone());

        tracing::info!(
            target = %target,
            source = %source,
            album = %target_key,
            members = moved_count,
            "identities merged"
        );
        Ok(MergeOutcome {
            moved_faces: moved_count,
            source_album,
            source_album_removed,
        })
    }
}

use crate::retry::RetryPolicy;
use facetag_core::{FaceId, FaceRecord, Links, ReplyContext, TokenError};
use facetag_store::{FaceStore, FaceStoreError, ObjectStore, ObjectStoreError};
use std::sync::Arc;
use thiserror::Error;

/// Longest accepted face name, in characters.
pub const MAX_NAME_CHARS: usize = 256;

#[derive(Error, Debug)]
pub enum TagError {
    #[error("reply context: {0}")]
    Token(#[from] TokenError),
    #[error("face name is empty")]
    EmptyName,
    #[error("face name exceeds {} characters", MAX_NAME_CHARS)]
    NameTooLong,
    #[error("no face record for {0}")]
    UnknownFace(FaceId),
    #[error("search name is empty")]
    EmptyQuery,
    #[error("face store: {0}")]
    Store(#[from] FaceStoreError),
    #[error("object store: {0}")]
    Objects(#[from] ObjectStoreError),
}

impl TagError {
    /// Caused by what the user sent, as opposed to a system failure.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Token(_)
                | Self::EmptyName
                | Self::NameTooLong
                | Self::UnknownFace(_)
                | Self::EmptyQuery
        )
    }

    /// Short chat-facing text. Never exposes internal error details.
    pub fn user_message(&self) -> String {
        match self {
            Self::Token(_) => {
                "Please reply directly to a face photo so I know which face you are naming.".into()
            }
            Self::EmptyName => "The name can't be empty.".into(),
            Self::NameTooLong => {
                format!("That name is too long (at most {MAX_NAME_CHARS} characters).")
            }
            Self::UnknownFace(_) => {
                "I can't find that face anymore. Ask for a new one with /getface.".into()
            }
            Self::EmptyQuery => "Tell me who to look for, for example: find Alice".into(),
            Self::Store(_) | Self::Objects(_) => {
                "Something went wrong on my side. Please try again later.".into()
            }
        }
    }
}

/// A face offered to the user for naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedFace {
    pub face_id: FaceId,
    pub source_image_id: String,
    pub display_url: String,
    /// Attached to the outbound message; the transport echoes it on reply.
    pub context: ReplyContext,
}

/// Offers unnamed faces, records names, answers name searches.
pub struct Tagger {
    faces: Arc<FaceStore>,
    objects: Arc<dyn ObjectStore>,
    photos_bucket: String,
    faces_bucket: String,
    links: Links,
    retry: RetryPolicy,
}

impl Tagger {
    pub fn new(
        faces: Arc<FaceStore>,
        objects: Arc<dyn ObjectStore>,
        photos_bucket: impl Into<String>,
        faces_bucket: impl Into<String>,
        links: Links,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            faces,
            objects,
            photos_bucket: photos_bucket.into(),
            faces_bucket: faces_bucket.into(),
            links,
            retry,
        }
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    /// Any face without a name, or `None` when every face is named.
    pub fn next_unnamed_face(&self) -> Result<Option<OfferedFace>, TagError> {
        let record = self.retry.run("pick unnamed face", FaceStoreError::is_transient, || {
            self.faces.next_unnamed()
        })?;
        let Some(record) = record else {
            tracing::info!("tag: no unnamed faces left");
            return Ok(None);
        };
        tracing::info!(
            face_id = %record.face_id,
            source = %record.source_image_id,
            "tag: offering face"
        );
        Ok(Some(OfferedFace {
            display_url: self.links.face_url(&record.face_id),
            context: ReplyContext::face(record.face_id.clone()),
            face_id: record.face_id,
            source_image_id: record.source_image_id,
        }))
    }

    /// Name the face the reply context points at. Last writer wins.
    pub fn assign_name(&self, context: &ReplyContext, name: &str) -> Result<FaceRecord, TagError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TagError::EmptyName);
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(TagError::NameTooLong);
        }
        let ReplyContext::Face { face_id } = context;

        let updated = self.retry.run("assign face name", FaceStoreError::is_transient, || {
            self.faces.assign_name(face_id, name)
        })?;
        if !updated {
            return Err(TagError::UnknownFace(face_id.clone()));
        }
        tracing::info!(face_id = %face_id, name, "tag: face named");

        let record = self.faces.get(face_id)?;
        record.ok_or_else(|| TagError::UnknownFace(face_id.clone()))
    }

    /// Like [`Tagger::assign_name`], taking the raw token echoed by the transport.
    pub fn assign_name_from_echo(
        &self,
        echo: Option<&str>,
        name: &str,
    ) -> Result<FaceRecord, TagError> {
        let context = match ReplyContext::from_echo(echo) {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(error = %e, "tag: reply without usable context");
                return Err(e.into());
            }
        };
        self.assign_name(&context, name)
    }

    /// Distinct source images containing a face named exactly `name`.
    ///
    /// An empty vec means nobody by that name; it is not an error.
    pub fn find_photos_by_name(&self, name: &str) -> Result<Vec<String>, TagError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TagError::EmptyQuery);
        }
        let ids = self.retry.run("find photos by name", FaceStoreError::is_transient, || {
            self.faces.image_ids_by_name(name)
        })?;
        tracing::info!(name, photos = ids.len(), "tag: name search");
        Ok(ids)
    }

    /// Bytes of a cropped face.
    pub fn face_image(&self, face_id: &FaceId) -> Result<Vec<u8>, TagError> {
        let key = face_id.object_key();
        Ok(self.retry.run("fetch face", ObjectStoreError::is_transient, || {
            self.objects.get(&self.faces_bucket, &key)
        })?)
    }

    /// Bytes of a source photo.
    pub fn photo(&self, image_id: &str) -> Result<Vec<u8>, TagError> {
        Ok(self.retry.run("fetch photo", ObjectStoreError::is_transient, || {
            self.objects.get(&self.photos_bucket, image_id)
        })?)
    }
}

//! Decides whether a storage change should enter the moderation pipeline.
//!
//! Every rule rejects one way the pipeline's own writes could re-trigger it.
//! Rules run in order and the first match wins; thumbnail detection runs
//! before the metadata check because generated thumbnails carry their own
//! metadata shape.

use crate::models::{
    event::{ResourceState, StorageObjectEvent},
    object::IS_MODERATED_KEY,
    thumbnail::ThumbnailSpec,
};

const IMAGE_CONTENT_TYPE_PREFIX: &str = "image/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Deleted,
    NotInitialWrite,
    NotAnImage,
    GeneratedThumbnail,
    AlreadyModerated,
    /// Event fields that cannot be interpreted safely.
    Ambiguous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject(RejectReason),
}

impl FilterDecision {
    pub fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }
}

#[derive(Clone, Debug)]
pub struct EventFilter {
    specs: Vec<ThumbnailSpec>,
}

impl EventFilter {
    pub fn new(specs: Vec<ThumbnailSpec>) -> Self {
        Self { specs }
    }

    pub fn should_process(&self, event: &StorageObjectEvent) -> bool {
        self.evaluate(event).is_accept()
    }

    pub fn evaluate(&self, event: &StorageObjectEvent) -> FilterDecision {
        use RejectReason::*;

        if event.resource_state == ResourceState::DeletedOrMoved {
            return FilterDecision::Reject(Deleted);
        }
        if event.generation_sequence_number < 1 || event.path.is_empty() {
            return FilterDecision::Reject(Ambiguous);
        }
        if event.generation_sequence_number > 1 {
            return FilterDecision::Reject(NotInitialWrite);
        }
        if !event.content_type.starts_with(IMAGE_CONTENT_TYPE_PREFIX) {
            return FilterDecision::Reject(NotAnImage);
        }
        if self.specs.iter().any(|spec| spec.matches(&event.path)) {
            return FilterDecision::Reject(GeneratedThumbnail);
        }
        // Any value other than an explicit "false" counts as moderated.
        if event
            .custom_metadata
            .get(IS_MODERATED_KEY)
            .is_some_and(|v| !v.trim().eq_ignore_ascii_case("false"))
        {
            return FilterDecision::Reject(AlreadyModerated);
        }
        FilterDecision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{object::CustomMetadata, thumbnail::default_specs};

    fn filter() -> EventFilter {
        EventFilter::new(default_specs())
    }

    fn event(path: &str) -> StorageObjectEvent {
        StorageObjectEvent {
            bucket: "photos".into(),
            path: path.into(),
            content_type: "image/png".into(),
            resource_state: ResourceState::CreatedOrUpdated,
            generation_sequence_number: 1,
            custom_metadata: CustomMetadata::new(),
        }
    }

    #[test]
    fn accepts_fresh_image() {
        assert_eq!(filter().evaluate(&event("u/a.png")), FilterDecision::Accept);
    }

    #[test]
    fn rejects_deleted_regardless_of_other_fields() {
        for generation in [0, 1, 7] {
            let mut e = event("u/a.png");
            e.resource_state = ResourceState::DeletedOrMoved;
            e.generation_sequence_number = generation;
            assert_eq!(
                filter().evaluate(&e),
                FilterDecision::Reject(RejectReason::Deleted)
            );
        }
    }

    #[test]
    fn rejects_metadata_and_later_writes() {
        for generation in [2, 3, 100] {
            let mut e = event("u/a.png");
            e.generation_sequence_number = generation;
            assert!(!filter().should_process(&e));
        }
    }

    #[test]
    fn rejects_non_images() {
        for content_type in ["application/pdf", "text/plain", "", "IMAGE"] {
            let mut e = event("u/a.png");
            e.content_type = content_type.into();
            assert_eq!(
                filter().evaluate(&e),
                FilterDecision::Reject(RejectReason::NotAnImage)
            );
        }
    }

    #[test]
    fn rejects_thumbnails_before_looking_at_metadata() {
        for path in ["u/a_large.png", "u/a_medium.png", "a_small.jpg"] {
            let mut e = event(path);
            e.custom_metadata
                .insert(IS_MODERATED_KEY.into(), "true".into());
            assert_eq!(
                filter().evaluate(&e),
                FilterDecision::Reject(RejectReason::GeneratedThumbnail),
                "{path}"
            );
            e.custom_metadata.clear();
            assert!(!filter().should_process(&e), "{path}");
        }
    }

    #[test]
    fn rejects_moderated_unless_explicitly_false() {
        for value in ["true", "TRUE", "1", "yes"] {
            let mut e = event("u/a.png");
            e.custom_metadata.insert(IS_MODERATED_KEY.into(), value.into());
            assert_eq!(
                filter().evaluate(&e),
                FilterDecision::Reject(RejectReason::AlreadyModerated)
            );
        }
        let mut e = event("u/a.png");
        e.custom_metadata
            .insert(IS_MODERATED_KEY.into(), "false".into());
        assert!(filter().should_process(&e));
    }

    #[test]
    fn ambiguous_events_are_rejected() {
        let mut e = event("u/a.png");
        e.generation_sequence_number = 0;
        assert!(!filter().should_process(&e));
        assert!(!filter().should_process(&event("")));
    }
}

//! Mapping from ledger entries to API routes

use super::http::Method;
use crate::models::{EntityType, OperationType};

/// Method and path template for one kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub method: Method,
    pub template: &'static str,
}

impl Endpoint {
    const fn new(method: Method, template: &'static str) -> Self {
        Self { method, template }
    }

    /// Path with `:id` replaced by the percent-encoded `entity_id`
    pub fn path(&self, entity_id: &str) -> String {
        self.template.replace(":id", &urlencoding::encode(entity_id))
    }
}

/// Route for `(entity_type, operation_type)`, or `None` if the API has none
pub fn endpoint_for(entity_type: EntityType, operation_type: OperationType) -> Option<Endpoint> {
    use EntityType as E;
    use Method::*;
    use OperationType as O;

    let endpoint = match (entity_type, operation_type) {
        (E::Task, O::Create) => Endpoint::new(Post, "/tasks"),
        (E::Task, O::Update) => Endpoint::new(Put, "/tasks/:id"),
        (E::Task, O::Delete) => Endpoint::new(Delete, "/tasks/:id"),

        (E::Space, O::Create) => Endpoint::new(Post, "/spaces"),
        (E::Space, O::Update) => Endpoint::new(Put, "/spaces/:id"),
        (E::Space, O::Delete) => Endpoint::new(Delete, "/spaces/:id"),

        (E::RepetitiveTaskTemplate, O::Create) => Endpoint::new(Post, "/repetitive-task-templates"),
        (E::RepetitiveTaskTemplate, O::Update) => {
            Endpoint::new(Put, "/repetitive-task-templates/:id")
        }
        (E::RepetitiveTaskTemplate, O::Delete) => {
            Endpoint::new(Delete, "/repetitive-task-templates/:id")
        }

        (E::Tag, O::Create) => Endpoint::new(Post, "/tags"),
        // Tags are renamed by delete + create
        (E::Tag, O::Update) => return None,
        (E::Tag, O::Delete) => Endpoint::new(Delete, "/tags/:id"),
    };
    Some(endpoint)
}

use serde_json::Value;
use tracing::{error, info};

use crate::accounts::{user_interest_names, visited_places, VisitedPlace};
use crate::context::{AuthenticatedUser, RequestContext};
use crate::errors::{AppError, AppResult};
use crate::model::ModelClient;
use crate::pipeline::json_kind;

pub const RECENT_VISITS: usize = 10;

pub const RECOMMENDATIONS_SCHEMA: &str = r#"[
  {
    "name": "string (name of the recommended place)",
    "lat": float (latitude),
    "lng": float (longitude),
    "reason": "string (why it matches the user's interests and profile)",
    "tags": ["interest1", "interest2", ...] (relevant interest tags)
  },
  ...
] (return 3-5 recommendations as a JSON array)"#;

#[derive(Clone)]
pub struct Recommender {
    model: ModelClient,
}

impl Recommender {
    pub fn new(model: ModelClient) -> Self {
        Self { model }
    }

    pub async fn recommend(&self, ctx: &RequestContext, user: &AuthenticatedUser) -> AppResult<Value> {
        let (interests, visited) = ctx.with_connection(|conn| {
            Ok((
                user_interest_names(conn, user.id)?,
                visited_places(conn, user.id, Some(RECENT_VISITS))?,
            ))
        })?;
        info!(
            target: "recommendations",
            user_id = user.id,
            interests = interests.len(),
            visited = visited.len(),
            "generating recommendations"
        );

        let prompt = build_prompt(&interests, &visited);
        match self.model.generate(&prompt, RECOMMENDATIONS_SCHEMA).await? {
            list @ Value::Array(_) => Ok(list),
            other => {
                error!(target: "recommendations", kind = json_kind(&other), "model returned a non-list");
                Err(AppError::UnexpectedModelShape {
                    expected: "array",
                    actual: json_kind(&other),
                })
            }
        }
    }
}

pub fn build_prompt(interests: &[String], visited: &[VisitedPlace]) -> String {
    let interests = if interests.is_empty() {
        "Not specified".to_string()
    } else {
        interests.join(", ")
    };
    let visited = if visited.is_empty() {
        "No records".to_string()
    } else {
        visited
            .iter()
            .take(RECENT_VISITS)
            .map(|v| {
                format!(
                    "'{}' ({:.3},{:.3})",
                    v.place_name.as_deref().unwrap_or("Unknown"),
                    v.lat,
                    v.lng
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    };

    format!(
        "Based on the user profile, generate 3-5 travel recommendations as a JSON array.\n\
         \n\
         User profile:\n\
         - Interests: {interests}\n\
         - Recently visited places (partial): {visited}\n\
         \n\
         Generate a JSON array of objects matching this structure:\n\
         {RECOMMENDATIONS_SCHEMA}\n\
         \n\
         Requirements:\n\
         - Recommend places the user has not visited recently (if possible).\n\
         - Recommendations must match the user's interests.\n\
         - Give a short `reason` explaining the relevance.\n\
         - Include geographic coordinates (`lat`, `lng`).\n\
         - Include relevant `tags` from the user's interest list.\n\
         - Focus on diverse and interesting locations.\n\
         \n\
         Return ONLY a valid JSON array, without introductory text or markdown."
    )
}

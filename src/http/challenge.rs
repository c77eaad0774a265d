//! Challenge page and answer check.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Form;
use serde::Deserialize;

use crate::firewall::HitKind;
use crate::http::pipeline::GatewayState;
use crate::http::response::{escape_html, temporary_redirect};
use crate::security::challenge::MAX_ATTEMPTS;
use crate::security::ChallengeOutcome;

#[derive(Debug, Deserialize)]
pub struct ConfirmQuery {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChallengeAnswer {
    pub id: String,
    #[serde(default)]
    pub answer: String,
}

fn challenge_page(action: &str, id: &str, prompt: &str, retry: bool) -> Response {
    let notice = if retry { "<p>Wrong answer, please try again.</p>\n" } else { "" };
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Verification</title></head>
<body style="font-family: Arial, Helvetica, sans-serif; text-align: center;">
<h2>Please confirm you are human</h2>
{notice}<form method="post" action="{action}">
<input type="hidden" name="id" value="{id}">
<p>{prompt}</p>
<input type="text" name="answer" autocomplete="off" autofocus>
<button type="submit">Submit</button>
</form>
</body>
</html>
"#,
        action = escape_html(action),
        id = escape_html(id),
        prompt = escape_html(prompt),
    );
    let status = if retry { StatusCode::UNPROCESSABLE_ENTITY } else { StatusCode::OK };
    (status, Html(body)).into_response()
}

/// `GET {challenge_path}/confirm?id=`
pub async fn confirm(State(state): State<GatewayState>, Query(query): Query<ConfirmQuery>) -> Response {
    let challenges = state.enforcer.challenges();
    match challenges.question(&query.id) {
        Some(prompt) => {
            let action = format!("{}/validate", state.enforcer.challenge_path());
            challenge_page(&action, &query.id, &prompt, false)
        }
        None => temporary_redirect("/"),
    }
}

/// `POST {challenge_path}/validate`
pub async fn validate(State(state): State<GatewayState>, Form(form): Form<ChallengeAnswer>) -> Response {
    let challenges = state.enforcer.challenges();
    match challenges.verify(&form.id, &form.answer) {
        ChallengeOutcome::Solved(record) => {
            if record.hit.kind == HitKind::Flood {
                state.manager.flood().clear_client(record.app_id, &record.hit.client_id);
            }
            tracing::info!(app_id = record.app_id, policy_id = record.hit.policy_id, "Challenge solved");
            let target = if record.hit.target_url.starts_with('/') {
                record.hit.target_url.as_str()
            } else {
                "/"
            };
            redirect_after_post(target)
        }
        ChallengeOutcome::Wrong => match challenges.question(&form.id) {
            Some(prompt) => {
                let action = format!("{}/validate", state.enforcer.challenge_path());
                challenge_page(&action, &form.id, &prompt, true)
            }
            None => redirect_after_post("/"),
        },
        ChallengeOutcome::Exhausted => {
            tracing::info!(attempts = MAX_ATTEMPTS, "Challenge abandoned after wrong answers");
            redirect_after_post("/")
        }
        ChallengeOutcome::Expired => {
            tracing::debug!("Challenge record missing or expired");
            redirect_after_post("/")
        }
    }
}

/// 303 so the browser follows with a GET.
fn redirect_after_post(location: &str) -> Response {
    axum::response::Redirect::to(location).into_response()
}

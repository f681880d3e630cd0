//! `EventsApi` over the backend's REST endpoints.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{EventDetail, EventId, EventPatch, EventSummary},
    error::{ApiError, ErrorCode},
    protocol::{ErrorBody, EventListResponse, EventResponse, UpdateEventRequest},
};
use tracing::debug;
use url::Url;

use crate::{CancelSignal, EventsApi};

pub struct HttpEventsApi {
    http: Client,
    base_url: Url,
}

impl HttpEventsApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid events api url '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("events api url '{base_url}' cannot be used as a base"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn events_url(&self, id: Option<&EventId>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("events");
            if let Some(id) = id {
                segments.push(id.as_str());
            }
        }
        url
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    ApiError::network(err.to_string())
}

fn cancelled() -> ApiError {
    ApiError::network("request cancelled")
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        _ => ErrorCode::Network,
    }
}

/// Passes 2xx responses through and turns anything else into an `ApiError`
/// carrying the server's message when it sent one.
async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: ErrorBody = response.json().await.unwrap_or_default();
    Err(ApiError {
        code: code_for_status(status),
        message: body
            .message
            .unwrap_or_else(|| format!("request failed with status {status}")),
        fields: body.fields,
    })
}

#[async_trait]
impl EventsApi for HttpEventsApi {
    async fn fetch_event_list(&self, cancel: &CancelSignal) -> Result<Vec<EventSummary>, ApiError> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let url = self.events_url(None);
        debug!(%url, "http: fetching event list");
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        let body: EventListResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(body.events)
    }

    async fn fetch_event(
        &self,
        id: &EventId,
        cancel: &CancelSignal,
    ) -> Result<EventDetail, ApiError> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let url = self.events_url(Some(id));
        debug!(%url, "http: fetching event");
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        let body: EventResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(body.event)
    }

    async fn update_event(
        &self,
        id: &EventId,
        patch: &EventPatch,
    ) -> Result<EventDetail, ApiError> {
        let url = self.events_url(Some(id));
        debug!(%url, "http: updating event");
        let response = self
            .http
            .put(url)
            .json(&UpdateEventRequest {
                event: patch.clone(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        let body: EventResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(body.event)
    }

    async fn delete_event(&self, id: &EventId) -> Result<(), ApiError> {
        let url = self.events_url(Some(id));
        debug!(%url, "http: deleting event");
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;

//! Live browsing sessions over the Chrome DevTools protocol.
//!
//! Every [`ChromiumSession`] launches its own browser process, so concurrent
//! sessions share no cookies or form state with each other.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{ElementHandle, Session, SessionError, SessionFactory, WaitState};

const IS_VISIBLE_SCRIPT: &str = r#"(selector) => {
    const el = document.querySelector(selector);
    if (!el) return false;
    const style = window.getComputedStyle(el);
    return style.visibility !== 'hidden' && style.display !== 'none' && el.getClientRects().length > 0;
}"#;

const SELECT_OPTION_SCRIPT: &str = r#"(args) => {
    const select = document.querySelector(args.selector);
    if (!select) return false;
    select.value = args.value;
    select.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
}"#;

fn backend(err: impl std::fmt::Display) -> SessionError {
    SessionError::Backend(err.to_string())
}

/// Invocation expression for a function literal applied to JSON arguments.
fn call_expression(script: &str, args: &JsonValue) -> String {
    format!("({script})({args})")
}

#[derive(Debug, Clone)]
pub struct ChromiumSessionFactory {
    headless: bool,
    poll_interval: Duration,
}

impl ChromiumSessionFactory {
    pub fn new(headless: bool) -> Self {
        Self {
            headless,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    type Session = ChromiumSession;

    async fn open(&self) -> Result<Self::Session, SessionError> {
        let mut builder = BrowserConfig::builder();
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(SessionError::Backend)?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(backend)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        let page = browser.new_page("about:blank").await.map_err(backend)?;
        Ok(ChromiumSession {
            browser: Mutex::new(browser),
            page,
            handler,
            poll_interval: self.poll_interval,
        })
    }
}

pub struct ChromiumSession {
    browser: Mutex<Browser>,
    page: Page,
    handler: JoinHandle<()>,
    poll_interval: Duration,
}

impl std::fmt::Debug for ChromiumSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumSession").finish_non_exhaustive()
    }
}

impl ChromiumSession {
    async fn is_visible(&self, selector: &str) -> bool {
        let expression = call_expression(IS_VISIBLE_SCRIPT, &JsonValue::from(selector));
        match self.page.evaluate(expression).await {
            Ok(result) => result.into_value::<bool>().unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn first_match(&self, selector: &str, state: WaitState) -> Option<Element> {
        let element = self.page.find_elements(selector).await.ok()?.into_iter().next()?;
        if state == WaitState::Visible && !self.is_visible(selector).await {
            return None;
        }
        Some(element)
    }
}

pub struct ChromiumElement {
    element: Element,
}

#[async_trait]
impl ElementHandle for ChromiumElement {
    async fn text(&self) -> Result<String, SessionError> {
        Ok(self
            .element
            .inner_text()
            .await
            .map_err(backend)?
            .unwrap_or_default())
    }

    async fn click(&self) -> Result<(), SessionError> {
        self.element.click().await.map_err(backend)?;
        Ok(())
    }

    async fn query(&self, selector: &str) -> Result<Option<Self>, SessionError> {
        Ok(self.query_all(selector).await?.into_iter().next())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Self>, SessionError> {
        let elements = self
            .element
            .find_elements(selector)
            .await
            .map_err(backend)?;
        Ok(elements
            .into_iter()
            .map(|element| ChromiumElement { element })
            .collect())
    }
}

#[async_trait]
impl Session for ChromiumSession {
    type Element = ChromiumElement;

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| SessionError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn select_option(&self, selector: &str, value: &str) -> Result<(), SessionError> {
        let selected = self
            .evaluate(
                SELECT_OPTION_SCRIPT,
                serde_json::json!({ "selector": selector, "value": value }),
            )
            .await?;
        if selected.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(SessionError::MissingElement(selector.to_string()))
        }
    }

    async fn evaluate(&self, script: &str, args: JsonValue) -> Result<JsonValue, SessionError> {
        let result = self
            .page
            .evaluate(call_expression(script, &args))
            .await
            .map_err(|e| SessionError::Script(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(JsonValue::Null))
    }

    async fn wait_for(
        &self,
        selector: &str,
        state: WaitState,
        timeout: Duration,
    ) -> Result<Self::Element, SessionError> {
        let poll = async {
            loop {
                if let Some(element) = self.first_match(selector, state).await {
                    return element;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map(|element| ChromiumElement { element })
            .map_err(|_| SessionError::timeout(selector, timeout))
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Self::Element>, SessionError> {
        let elements = self.page.find_elements(selector).await.map_err(backend)?;
        Ok(elements
            .into_iter()
            .map(|element| ChromiumElement { element })
            .collect())
    }

    async fn content(&self) -> Result<String, SessionError> {
        self.page.content().await.map_err(backend)
    }

    async fn close(self) -> Result<(), SessionError> {
        let ChromiumSession {
            browser,
            page,
            handler,
            ..
        } = self;
        if let Err(err) = page.close().await {
            debug!(error = %err, "closing page failed");
        }
        let mut browser = browser.into_inner();
        let closed = browser.close().await.map_err(backend);
        let _ = browser.wait().await;
        handler.abort();
        closed.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_expression_embeds_json_arguments() {
        let expression = call_expression(
            "(args) => args.value",
            &serde_json::json!({ "value": "01/02/2023" }),
        );
        assert_eq!(expression, r#"((args) => args.value)({"value":"01/02/2023"})"#);
    }
}

//! Game client driven through the automation backend.
//!
//! Implements polling detection, the commit sequence and session control as
//! fixed sequences of transport requests against the game's DOM.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::actions::{CommitActions, SessionControl};
use crate::config::RaceConfig;
use crate::detector::{OpponentDetector, Presence};
use crate::error::TransportError;
use crate::transport::{Request, SelectorType, SequentialStep, Transport};

// =============================================================================
// SELECTORS
// =============================================================================

const OPPONENT_NAME_SELECTOR: &str = ".planet-bar__item-name__name";
const EVENTS_PANEL_SELECTOR: &str = ".planet__events";
const ACTION_BUTTON_SELECTOR: &str = ".planet-bar__button__action > img";
const COMMIT_MENU_ITEM_SELECTOR: &str = ".dialog-item-menu__actions__item:last-child > .mdc-list-item__text";
const DIALOG_CLOSE_SELECTOR: &str = ".dialog__close-button > img";
const EXIT_XPATH: &str = "//a[contains(.,'Exit')]";
const ONLINE_NOW_XPATH: &str = "//span[contains(.,'Online now')]";
const BLOCKED_BANNER_SELECTOR: &str = ".mdc-button > .mdc-top-app-bar__title";
const LOGIN_BUTTON_SELECTOR: &str = ".mdc-button--black-secondary > .mdc-button__label";
const LOGIN_CONFIRM_SELECTOR: &str = ".mdc-dialog__button:nth-child(2)";

/// Number of clicks needed to bring the events panel to the front
const EVENTS_PANEL_CLICKS: usize = 3;
/// Settle time after opening the online list
const ONLINE_LIST_SETTLE_MS: u64 = 300;
/// Settle time before the login button appears
const LOGIN_SETTLE_MS: u64 = 4_000;

/// XPath string literal for arbitrary text
fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        format!("'{}'", text)
    } else if !text.contains('"') {
        format!("\"{}\"", text)
    } else {
        let parts: Vec<String> = text.split('\'').map(|p| format!("'{}'", p)).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

fn span_containing(text: &str) -> String {
    format!("//span[contains(.,{})]", xpath_literal(text))
}

fn list_item_containing(text: &str) -> String {
    format!("//li[contains(., {})]", xpath_literal(text.trim()))
}

/// Release sequence for a blocked actor (run inside the game's iframes)
fn release_sequence() -> Vec<Request> {
    let frame = |frame_index: u32, selector: &str| Request::SwitchToFrame {
        frame_index,
        selector_type: SelectorType::Css,
        selector: selector.to_string(),
    };
    vec![
        Request::Xpath {
            xpath: "//span[contains(.,'Planet Info')]".to_string(),
        },
        Request::Sleep { ms: 3_000 },
        frame(1, ".free__early__release:nth-child(2) .free__early__release__title"),
        Request::Sleep { ms: 250 },
        frame(1, "#yes_btn > p"),
        Request::Sleep { ms: 250 },
        Request::SwitchToDefaultFrame {
            selector: ".mdc-icon-button > img".to_string(),
        },
        Request::Sleep { ms: 4_000 },
        frame(1, ".s__gd__plank:nth-child(1) .text"),
        Request::Sleep { ms: 500 },
        Request::SwitchToFramePlanet {
            frame_index: 2,
            selector_type: SelectorType::Css,
            selector: "div.gc-action > a".to_string(),
        },
    ]
}

/// Errors that only mean "this UI step did not work out"
fn is_step_failure(e: &TransportError) -> bool {
    matches!(
        e,
        TransportError::Remote { .. } | TransportError::Timeout { .. } | TransportError::Malformed(_)
    )
}

// =============================================================================
// SESSION
// =============================================================================

/// One logged-in game client behind a transport
pub struct BrowserSession {
    transport: Arc<dyn Transport>,
}

impl BrowserSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn send(&self, request: Request) -> Result<(), TransportError> {
        self.transport.request(request).await.map(|_| ())
    }

    async fn click(&self, selector: &str) -> Result<(), TransportError> {
        self.send(Request::Click {
            selector: selector.to_string(),
        })
        .await
    }

    /// Location and online list open; `Ok(false)` if the page is not where we expect
    async fn open_online_list(&self, cfg: &RaceConfig) -> Result<bool, TransportError> {
        let steps = [
            Request::Xpath {
                xpath: span_containing(&cfg.location),
            },
            Request::Xpath {
                xpath: ONLINE_NOW_XPATH.to_string(),
            },
            Request::Sleep {
                ms: ONLINE_LIST_SETTLE_MS,
            },
        ];
        for step in steps {
            match self.send(step).await {
                Ok(()) => {}
                Err(e) if is_step_failure(&e) => {
                    debug!(error = %e, location = %cfg.location, "online_list_unavailable");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl OpponentDetector for BrowserSession {
    async fn detect(&self, cfg: &RaceConfig) -> Result<Presence, TransportError> {
        if cfg.opponents.is_empty() || !self.open_online_list(cfg).await? {
            return Ok(Presence::absent());
        }

        for opponent in &cfg.opponents {
            let request = Request::WaitForXPath {
                xpath: list_item_containing(opponent),
            };
            match self.transport.request(request).await {
                Ok(_) => return Ok(Presence::seen(Some(opponent.clone()))),
                Err(e) if is_step_failure(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Presence::absent())
    }

    async fn still_present(&self, cfg: &RaceConfig) -> Presence {
        if cfg.opponents.is_empty() {
            return Presence::absent();
        }
        let request = Request::CheckUsername {
            selector: OPPONENT_NAME_SELECTOR.to_string(),
            expected_text: cfg.opponents.iter().map(|o| o.trim().to_string()).collect(),
        };
        match self.transport.request(request).await {
            Ok(resp) if resp.bool_field("matches").unwrap_or(false) => {
                Presence::seen(resp.str_field("matchedText").map(str::to_string))
            }
            Ok(_) => Presence::absent(),
            Err(e) => {
                debug!(error = %e, "presence_recheck_failed");
                Presence::absent()
            }
        }
    }
}

#[async_trait]
impl CommitActions for BrowserSession {
    async fn prepare(&self, cfg: &RaceConfig) -> Result<Option<String>, TransportError> {
        if cfg.opponents.is_empty() {
            return Ok(None);
        }
        let request = Request::SearchAndClick {
            rivals: cfg.opponents.clone(),
        };
        let resp = match self.transport.request(request).await {
            Ok(resp) => resp,
            Err(e) if is_step_failure(&e) => {
                debug!(error = %e, "opponent_selection_failed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match resp.require_bool("flag") {
            Ok(true) => Ok(Some(
                resp.str_field("matchedRival")
                    .map(str::to_string)
                    .unwrap_or_else(|| cfg.opponents[0].clone()),
            )),
            Ok(false) => Ok(None),
            Err(e) => {
                debug!(error = %e, "opponent_selection_failed");
                Ok(None)
            }
        }
    }

    async fn commit(&self, _cfg: &RaceConfig) -> Result<(), TransportError> {
        for _ in 0..EVENTS_PANEL_CLICKS {
            self.click(EVENTS_PANEL_SELECTOR).await?;
        }
        self.send(Request::PressShiftC {
            selector: ACTION_BUTTON_SELECTOR.to_string(),
        })
        .await?;
        self.send(Request::PerformSequentialActions {
            actions: vec![
                SequentialStep::Click {
                    selector: COMMIT_MENU_ITEM_SELECTOR.to_string(),
                },
                SequentialStep::Click {
                    selector: DIALOG_CLOSE_SELECTOR.to_string(),
                },
                SequentialStep::Xpath {
                    xpath: EXIT_XPATH.to_string(),
                },
            ],
        })
        .await
    }

    async fn dismiss(&self) {
        if let Err(e) = self.click(DIALOG_CLOSE_SELECTOR).await {
            debug!(error = %e, "dismiss_failed");
        }
    }
}

#[async_trait]
impl SessionControl for BrowserSession {
    async fn login(&self, cfg: &RaceConfig) -> Result<(), TransportError> {
        info!("login_started");
        self.send(Request::Sleep { ms: LOGIN_SETTLE_MS }).await?;
        self.send(Request::WaitForClickable {
            selector: LOGIN_BUTTON_SELECTOR.to_string(),
        })
        .await?;
        self.click(LOGIN_BUTTON_SELECTOR).await?;
        self.send(Request::EnterRecoveryCode {
            code: cfg.recovery_code.clone(),
        })
        .await?;
        self.click(LOGIN_CONFIRM_SELECTOR).await?;
        info!("login_completed");
        Ok(())
    }

    async fn is_blocked(&self, cfg: &RaceConfig) -> Result<bool, TransportError> {
        // our own location shows up in the bar only while we are free
        let resp = match self
            .transport
            .request(Request::FindAndClickByPartialText {
                text: cfg.location.clone(),
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_remote() => {
                debug!(error = %e, "blocked_check_inconclusive");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if resp.require_bool("flag")? {
            return Ok(false);
        }

        self.send(Request::WaitForClickable {
            selector: ACTION_BUTTON_SELECTOR.to_string(),
        })
        .await?;
        self.click(BLOCKED_BANNER_SELECTOR).await?;
        Ok(true)
    }

    async fn release(&self, _cfg: &RaceConfig) -> Result<(), TransportError> {
        info!("release_started");
        for step in release_sequence() {
            self.send(step).await?;
        }
        self.reload().await?;
        info!("release_completed");
        Ok(())
    }

    async fn reload(&self) -> Result<(), TransportError> {
        self.send(Request::ReloadPage).await
    }

    async fn recover(&self, cfg: &RaceConfig) -> Result<(), TransportError> {
        warn!("session_recovery_started");
        self.transport.reconnect().await?;
        self.reload().await?;
        self.login(cfg).await
    }

    async fn screenshot(&self, path: &str) -> Result<(), TransportError> {
        self.send(Request::Screenshot {
            path: path.to_string(),
        })
        .await
    }
}

// =============================================================================
// Telegram listener — long-polling adapter for the signal channel
// =============================================================================
//
// Polls the Bot API with getUpdates and funnels channel messages into the
// same handlers the webhook uses: open signals into the admission buffer,
// close commands and TP-hit notices into the event handlers. Messages that
// parse as nothing are dropped silently; the channel carries plenty of chat.
// =============================================================================

use std::sync::Arc;

use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use crate::app_state::AppState;
use crate::orchestrator::{admission, events};
use crate::parser::{parse_close_signal, parse_signal, parse_tp_hit};

/// Long-poll hold time requested from the Bot API.
const POLL_TIMEOUT_SECS: u64 = 50;

pub async fn run_telegram_listener(state: Arc<AppState>) {
    let token = state.config.telegram_bot_token.clone();
    if token.is_empty() {
        info!("telegram listener disabled (no bot token)");
        return;
    }
    let chat_filter = state.config.telegram_chat_id.clone();
    let base = format!("https://api.telegram.org/bot{token}");

    // The HTTP timeout must outlast the long poll.
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "telegram client build failed");
            return;
        }
    };

    let filter_label = if chat_filter.is_empty() {
        "<any>"
    } else {
        chat_filter.as_str()
    };
    info!(chat_filter = filter_label, "telegram listener started");

    let mut offset: i64 = 0;
    loop {
        let url = format!("{base}/getUpdates?timeout={POLL_TIMEOUT_SECS}&offset={offset}");
        let body: Value = match client.get(&url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "telegram response parse failed, retrying in 5s");
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            },
            Err(e) => {
                error!(error = %e, "telegram poll failed, retrying in 5s");
                sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let Some(updates) = body.get("result").and_then(|v| v.as_array()) else {
            debug!("telegram poll returned no result array");
            sleep(Duration::from_secs(5)).await;
            continue;
        };

        for update in updates {
            if let Some(update_id) = update.get("update_id").and_then(|v| v.as_i64()) {
                offset = offset.max(update_id + 1);
            }

            let message = update
                .get("channel_post")
                .or_else(|| update.get("message"));
            let Some(message) = message else { continue };

            if !chat_filter.is_empty() {
                let chat_id = message
                    .get("chat")
                    .and_then(|c| c.get("id"))
                    .and_then(|v| v.as_i64())
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                let chat_name = message
                    .get("chat")
                    .and_then(|c| c.get("username"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if chat_id != chat_filter && chat_name != chat_filter {
                    continue;
                }
            }

            let Some(text) = message.get("text").and_then(|v| v.as_str()) else {
                continue;
            };
            dispatch(&state, text).await;
        }
    }
}

/// Route one channel message. Close and TP-hit formats are checked before
/// the open-signal parser; anything unparseable is ignored.
async fn dispatch(state: &Arc<AppState>, text: &str) {
    if let Some(close) = parse_close_signal(text) {
        info!(symbol = %close.symbol_display, "channel close signal");
        let _ = events::handle_close_command(state, &close.symbol, "Channel close signal").await;
        return;
    }

    if let Some(hit) = parse_tp_hit(text) {
        debug!(symbol = %hit.symbol_display, tp = hit.tp_number, "channel TP-hit notice");
        events::handle_tp_hit(state, &hit.symbol, hit.tp_number).await;
        return;
    }

    if let Some(signal) = parse_signal(text, state.config.fallback_signal_leverage) {
        admission::add_signal(state, signal).await;
    }
}

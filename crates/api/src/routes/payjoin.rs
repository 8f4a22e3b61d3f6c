//! BIP78 PayJoin receiver endpoint

use axum::extract::{Query, State};
use serde::Deserialize;

use treasury_engine::payjoin::PayjoinParams;

use crate::{error::ApiError, state::AppState, ApiResult};

/// BIP78 query parameters. Names follow the wire protocol, not Rust style.
#[derive(Debug, Deserialize)]
pub struct PayjoinQuery {
    /// Protocol version; only 1 is supported.
    pub v: Option<u32>,
    pub maxadditionalfeecontribution: Option<u64>,
    pub additionalfeeoutputindex: Option<usize>,
    pub minfeerate: Option<f64>,
    pub disableoutputsubstitution: Option<bool>,
}

impl PayjoinQuery {
    fn params(&self) -> PayjoinParams {
        PayjoinParams {
            max_additional_fee_contribution: self.maxadditionalfeecontribution,
            additional_fee_output_index: self.additionalfeeoutputindex,
            min_fee_rate: self.minfeerate.unwrap_or(-1.0),
            disable_output_substitution: self.disableoutputsubstitution.unwrap_or(false),
        }
    }
}

/// POST /payjoin - negotiate a counter-proposal for the sender's original
/// PSBT. Body and response are base64 PSBT text; failures are BIP78 JSON
/// errors.
pub async fn propose(
    State(state): State<AppState>,
    Query(query): Query<PayjoinQuery>,
    body: String,
) -> ApiResult<String> {
    let version = query.v.unwrap_or(1);
    if version != 1 {
        return Err(ApiError::VersionUnsupported(version));
    }

    let proposal = state.payjoin.propose(&body, &query.params()).await?;
    Ok(proposal)
}

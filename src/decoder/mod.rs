//! Greedy transducer decoding over one chunk of encoder output.
//!
//! The decode loop is incremental: it resumes from the prediction-network
//! state `(hidden, cell, last_token)` the previous chunk ended with, and
//! returns the state the next chunk must resume from. The caller commits
//! that state together with the encoder cache record, so a failed or
//! cancelled chunk leaves no half-applied decode.
//!
//! Only the first `valid_out_len` encoder frames are decoded; later frames
//! are lookahead the encoder re-emits next chunk.

use ndarray::{s, Array3};
use tracing::{debug, trace};

use crate::error::{LoquiError, Result};
use crate::inference::{DecoderState, StreamingModels, MAX_SYMBOLS_PER_FRAME};

/// Result of decoding one chunk.
#[derive(Debug)]
pub struct DecodeOutcome {
    /// Non-blank token ids emitted by this chunk, in order.
    pub ids: Vec<i32>,
    /// Whether any frame's argmax hit the end-of-utterance class.
    pub eou_predicted: bool,
    /// Prediction-network state to resume from next chunk.
    pub state: DecoderState,
}

/// Greedy-decode the first `valid_out_len` frames of `encoded`.
///
/// `vocab_size` pins the joint logit layout: indices `[0..V)` are tokens,
/// `V` is blank, `V+1` the end-of-utterance class. A logit vector of any
/// other length is a model/vocabulary mismatch and surfaces as `Inference`.
pub fn decode_chunk(
    models: &mut dyn StreamingModels,
    encoded: &Array3<f32>,
    valid_out_len: usize,
    state: &DecoderState,
    vocab_size: usize,
) -> Result<DecodeOutcome> {
    let frames_out = encoded.shape()[2];
    let frames = valid_out_len.min(frames_out);

    let mut hidden = state.hidden.clone();
    let mut cell = state.cell.clone();
    let mut last_token = state.last_token;
    let mut ids = Vec::new();
    let mut eou_predicted = false;

    let blank_id = vocab_size;
    let eou_id = vocab_size + 1;

    for t in 0..frames {
        let frame: Array3<f32> = encoded.slice(s![.., .., t..t + 1]).to_owned();

        for _ in 0..MAX_SYMBOLS_PER_FRAME {
            let step = models.decoder(last_token, &hidden, &cell)?;
            let logits = models.joint(&frame, &step.output)?;
            if logits.len() != vocab_size + 2 {
                return Err(LoquiError::Inference(format!(
                    "joint produced {} logits, expected vocab {} + blank + eou",
                    logits.len(),
                    vocab_size
                )));
            }

            let best = argmax(&logits);
            if best == blank_id {
                break;
            }
            if best == eou_id {
                // Endpoint prediction: flag it, keep state untouched so the
                // next frame (or chunk) resumes from real token history.
                eou_predicted = true;
                trace!(frame = t, "end-of-utterance class predicted");
                break;
            }

            ids.push(best as i32);
            hidden = step.hidden;
            cell = step.cell;
            last_token = best as i32;
        }
    }

    if !ids.is_empty() {
        debug!(emitted = ids.len(), frames, eou_predicted, "chunk decoded");
    }

    Ok(DecodeOutcome {
        ids,
        eou_predicted,
        state: DecoderState {
            hidden,
            cell,
            last_token,
        },
    })
}

fn argmax(logits: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{DecoderForward, EncoderCaches, EncoderForward, DECODER_STATE_DIM};
    use ndarray::Array3;

    const VOCAB: usize = 8;

    /// Emits one fixed token per frame (first inner iteration), then blank.
    /// Tracks how many times each model was invoked.
    struct OneTokenPerFrame {
        token: usize,
        joint_calls: usize,
        decoder_calls: usize,
        last_frame_tag: Option<f32>,
        emitted_this_frame: bool,
        always_token: bool,
    }

    impl OneTokenPerFrame {
        fn new(token: usize) -> Self {
            Self {
                token,
                joint_calls: 0,
                decoder_calls: 0,
                last_frame_tag: None,
                emitted_this_frame: false,
                always_token: false,
            }
        }
    }

    impl crate::inference::StreamingModels for OneTokenPerFrame {
        fn warm_up(&mut self) -> crate::error::Result<()> {
            Ok(())
        }

        fn streaming_encoder(
            &mut self,
            _audio_signal: &Array3<f32>,
            _audio_length: i32,
            _caches: &EncoderCaches,
        ) -> crate::error::Result<EncoderForward> {
            unreachable!("decode tests feed encoded frames directly")
        }

        fn decoder(
            &mut self,
            last_token: i32,
            hidden: &Array3<f32>,
            cell: &Array3<f32>,
        ) -> crate::error::Result<DecoderForward> {
            self.decoder_calls += 1;
            let mut output = Array3::zeros((1, DECODER_STATE_DIM, 1));
            output.fill(last_token as f32);
            Ok(DecoderForward {
                output,
                hidden: hidden + 1.0,
                cell: cell + 1.0,
            })
        }

        fn joint(
            &mut self,
            encoder_frame: &Array3<f32>,
            _decoder_out: &Array3<f32>,
        ) -> crate::error::Result<Vec<f32>> {
            self.joint_calls += 1;
            // Each frame carries a distinct tag in its leading value.
            let frame_tag = encoder_frame[[0, 0, 0]];
            if self.last_frame_tag != Some(frame_tag) {
                self.last_frame_tag = Some(frame_tag);
                self.emitted_this_frame = false;
            }

            let mut logits = vec![0.0f32; VOCAB + 2];
            if self.always_token || !self.emitted_this_frame {
                logits[self.token] = 5.0;
                self.emitted_this_frame = true;
            } else {
                logits[VOCAB] = 5.0; // blank
            }
            Ok(logits)
        }
    }

    fn encoded(frames: usize) -> Array3<f32> {
        let mut enc = Array3::zeros((1, 4, frames));
        for t in 0..frames {
            enc[[0, 0, t]] = t as f32;
        }
        enc
    }

    #[test]
    fn truncates_to_valid_out_len() {
        let mut models = OneTokenPerFrame::new(3);
        let state = DecoderState::initial(VOCAB as i32);

        let outcome = decode_chunk(&mut models, &encoded(5), 2, &state, VOCAB).unwrap();
        // Two decoded frames, one token each; lookahead frames untouched.
        assert_eq!(outcome.ids, vec![3, 3]);
        assert_eq!(outcome.state.last_token, 3);
        assert_eq!(outcome.state.hidden[[0, 0, 0]], 2.0);
        // Every joint call is preceded by exactly one prediction step.
        assert_eq!(models.decoder_calls, models.joint_calls);
        assert_eq!(models.joint_calls, 4); // token + blank per frame
    }

    #[test]
    fn valid_out_len_beyond_available_frames_is_clamped() {
        let mut models = OneTokenPerFrame::new(2);
        let state = DecoderState::initial(VOCAB as i32);
        let outcome = decode_chunk(&mut models, &encoded(1), 4, &state, VOCAB).unwrap();
        assert_eq!(outcome.ids, vec![2]);
    }

    #[test]
    fn max_symbols_per_frame_bounds_the_inner_loop() {
        let mut models = OneTokenPerFrame::new(5);
        models.always_token = true;
        let state = DecoderState::initial(VOCAB as i32);

        let outcome = decode_chunk(&mut models, &encoded(2), 2, &state, VOCAB).unwrap();
        assert_eq!(outcome.ids.len(), 2 * MAX_SYMBOLS_PER_FRAME);
        assert_eq!(models.joint_calls, 2 * MAX_SYMBOLS_PER_FRAME);
    }

    /// Always predicts the end-of-utterance class.
    struct AlwaysEou;

    impl crate::inference::StreamingModels for AlwaysEou {
        fn warm_up(&mut self) -> crate::error::Result<()> {
            Ok(())
        }

        fn streaming_encoder(
            &mut self,
            _audio_signal: &Array3<f32>,
            _audio_length: i32,
            _caches: &EncoderCaches,
        ) -> crate::error::Result<EncoderForward> {
            unreachable!()
        }

        fn decoder(
            &mut self,
            last_token: i32,
            hidden: &Array3<f32>,
            cell: &Array3<f32>,
        ) -> crate::error::Result<DecoderForward> {
            let mut output = Array3::zeros((1, DECODER_STATE_DIM, 1));
            output.fill(last_token as f32);
            Ok(DecoderForward {
                output,
                hidden: hidden + 1.0,
                cell: cell + 1.0,
            })
        }

        fn joint(
            &mut self,
            _encoder_frame: &Array3<f32>,
            _decoder_out: &Array3<f32>,
        ) -> crate::error::Result<Vec<f32>> {
            let mut logits = vec![0.0f32; VOCAB + 2];
            logits[VOCAB + 1] = 5.0;
            Ok(logits)
        }
    }

    #[test]
    fn eou_prediction_leaves_state_untouched() {
        let mut models = AlwaysEou;
        let state = DecoderState::initial(VOCAB as i32);

        let outcome = decode_chunk(&mut models, &encoded(3), 3, &state, VOCAB).unwrap();
        assert!(outcome.eou_predicted);
        assert!(outcome.ids.is_empty());
        assert_eq!(outcome.state.last_token, VOCAB as i32);
        assert!(outcome.state.hidden.iter().all(|&v| v == 0.0));
    }

    /// Joint that reports a wrong logit width.
    struct WrongWidth;

    impl crate::inference::StreamingModels for WrongWidth {
        fn warm_up(&mut self) -> crate::error::Result<()> {
            Ok(())
        }

        fn streaming_encoder(
            &mut self,
            _audio_signal: &Array3<f32>,
            _audio_length: i32,
            _caches: &EncoderCaches,
        ) -> crate::error::Result<EncoderForward> {
            unreachable!()
        }

        fn decoder(
            &mut self,
            _last_token: i32,
            hidden: &Array3<f32>,
            cell: &Array3<f32>,
        ) -> crate::error::Result<DecoderForward> {
            Ok(DecoderForward {
                output: Array3::zeros((1, DECODER_STATE_DIM, 1)),
                hidden: hidden.clone(),
                cell: cell.clone(),
            })
        }

        fn joint(
            &mut self,
            _encoder_frame: &Array3<f32>,
            _decoder_out: &Array3<f32>,
        ) -> crate::error::Result<Vec<f32>> {
            Ok(vec![0.0; VOCAB]) // missing blank + eou slots
        }
    }

    #[test]
    fn mismatched_logit_width_is_an_inference_error() {
        let mut models = WrongWidth;
        let state = DecoderState::initial(VOCAB as i32);
        let err = decode_chunk(&mut models, &encoded(1), 1, &state, VOCAB).unwrap_err();
        assert!(matches!(err, LoquiError::Inference(_)));
    }
}

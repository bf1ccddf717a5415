use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rwkv_mobile::{
    tokenizer::AbcTokenizer, Error, ExecutionProvider, FinishReason, PenaltyParams, Result,
    Runtime, SamplerParams, Status,
};

const NUM_VOCAB: usize = 256;

type Script = Box<dyn FnMut(usize, &[u32]) -> Vec<f32> + Send>;

#[derive(Debug, Default)]
struct Journal {
    evals: Vec<Vec<u32>>,
    clears: usize,
    released: bool,
}

/// Produces logits from a closure over the call index and the tokens just fed.
struct ScriptedProvider {
    script: Script,
    fail_at: Option<usize>,
    fail_release_model: bool,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedProvider {
    fn new(script: impl FnMut(usize, &[u32]) -> Vec<f32> + Send + 'static) -> Self {
        Self {
            script: Box::new(script),
            fail_at: None,
            fail_release_model: false,
            journal: Default::default(),
        }
    }

    fn fail_at(mut self, call: usize) -> Self {
        self.fail_at = Some(call);
        self
    }

    fn fail_release_model(mut self) -> Self {
        self.fail_release_model = true;
        self
    }
}

impl ExecutionProvider for ScriptedProvider {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn load_model(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn num_vocab(&self) -> usize {
        NUM_VOCAB
    }

    fn eval_sequence(&mut self, tokens: &[u32], logits: &mut [f32]) -> Result<()> {
        assert_eq!(logits.len(), NUM_VOCAB);
        let call = {
            let mut journal = self.journal.lock().unwrap();
            journal.evals.push(tokens.to_vec());
            journal.evals.len() - 1
        };
        if self.fail_at == Some(call) {
            return Err(Error::new(Status::EVAL, "scripted failure"));
        }
        logits.copy_from_slice(&(self.script)(call, tokens));
        Ok(())
    }

    fn clear_state(&mut self) -> Result<()> {
        self.journal.lock().unwrap().clears += 1;
        Ok(())
    }

    fn release_model(&mut self) -> Result<()> {
        match self.fail_release_model {
            true => Err(Error::new(Status::MODEL, "scripted release failure")),
            false => Ok(()),
        }
    }

    fn release(&mut self) -> Result<()> {
        self.journal.lock().unwrap().released = true;
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}

fn one_hot(token: u8) -> Vec<f32> {
    let mut logits = vec![0.0; NUM_VOCAB];
    logits[token as usize] = 100.0;
    logits
}

/// Call `i` peaks at `text[i]`; afterwards at the end token.
fn spell(text: &'static [u8]) -> impl FnMut(usize, &[u32]) -> Vec<f32> + Send {
    move |call, _| one_hot(text.get(call).copied().unwrap_or(0))
}

fn greedy() -> SamplerParams {
    SamplerParams {
        top_k: 1,
        ..Default::default()
    }
}

fn no_penalty() -> PenaltyParams {
    PenaltyParams {
        presence_penalty: 0.0,
        frequency_penalty: 0.0,
        penalty_decay: 1.0,
    }
}

fn setup(provider: ScriptedProvider) -> (Runtime, Arc<Mutex<Journal>>) {
    let journal = provider.journal.clone();
    let mut runtime = Runtime::new();
    runtime.init_with_provider(Box::new(provider)).unwrap();
    runtime.load_tokenizer_with(Box::new(AbcTokenizer)).unwrap();
    runtime.load_model("assets/models/scripted.st").unwrap();
    runtime.set_sampler_params(greedy());
    runtime.set_penalty_params(no_penalty());
    (runtime, journal)
}

#[test]
fn chat_builds_role_prompt() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b" ok")));
    let response = runtime.chat("User", "Assistant", "hi", 16).unwrap();
    assert_eq!(response, " ok");

    let journal = journal.lock().unwrap();
    let prompt: Vec<u32> = b"User: hi\n\nAssistant:".iter().map(|&b| b as u32).collect();
    assert_eq!(journal.evals[0], prompt);
    assert_eq!(journal.evals[1..], [vec![b' ' as u32], vec![b'o' as u32], vec![b'k' as u32]]);
}

#[test]
fn zero_budget_is_empty_success() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"abc")));
    assert_eq!(runtime.gen_completion("prompt", 0).unwrap(), "");
    assert_eq!(journal.lock().unwrap().evals.len(), 1);
    assert!(runtime.penalties().is_empty());
}

#[test]
fn failed_priming_leaves_output_empty() {
    let (mut runtime, _) = setup(ScriptedProvider::new(spell(b"abc")).fail_at(0));
    let mut output = String::new();
    let err = runtime.generate("prompt", 8, &mut output).unwrap_err();
    assert!(err.status().contains(Status::EVAL));
    assert!(output.is_empty());
    assert!(runtime.penalties().is_empty());
}

#[test]
fn end_token_on_step_k_keeps_k_minus_one() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"abc")));
    let mut output = String::new();
    let reason = runtime.generate("prompt", 16, &mut output).unwrap();
    assert_eq!(reason, FinishReason::Stop);
    assert_eq!(output, "abc");
    // priming plus one evaluation per decoded token
    assert_eq!(journal.lock().unwrap().evals.len(), 4);
    assert_eq!(runtime.penalties().get(0), None);
}

#[test]
fn budget_exhaustion_is_length() {
    let (mut runtime, _) = setup(ScriptedProvider::new(spell(b"abcdef")));
    let mut output = String::new();
    let reason = runtime.generate("prompt", 3, &mut output).unwrap();
    assert_eq!(reason, FinishReason::Length);
    assert_eq!(output, "abc");
}

#[test]
fn blank_line_ends_turn() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"x\n\ny")));
    let mut output = String::new();
    let reason = runtime.generate("prompt", 16, &mut output).unwrap();
    assert_eq!(reason, FinishReason::Stop);
    assert_eq!(output, "x\n\n");
    // nothing is evaluated after the second newline
    assert_eq!(journal.lock().unwrap().evals.len(), 3);
}

#[test]
fn leading_newline_is_not_a_stop() {
    let (mut runtime, _) = setup(ScriptedProvider::new(spell(b"\nab")));
    assert_eq!(runtime.gen_completion("prompt", 16).unwrap(), "\nab");
}

#[test]
fn existing_output_does_not_count_toward_blank_line() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"\nabc")));
    let mut output = String::from("prefix\n");
    let reason = runtime.generate("prompt", 16, &mut output).unwrap();
    assert_eq!(reason, FinishReason::Stop);
    assert_eq!(output, "prefix\n\nabc");
    assert_eq!(journal.lock().unwrap().evals.len(), 5);
}

#[test]
fn completion_shares_the_blank_line_stop() {
    let (mut runtime, _) = setup(ScriptedProvider::new(spell(b"a\n\nb")));
    assert_eq!(runtime.gen_completion("prompt", 16).unwrap(), "a\n\n");
}

#[test]
fn failure_mid_loop_keeps_partial_output() {
    let (mut runtime, _) = setup(ScriptedProvider::new(spell(b"abcd")).fail_at(2));
    let mut output = String::new();
    let err = runtime.generate("prompt", 16, &mut output).unwrap_err();
    assert!(err.status().contains(Status::EVAL));
    assert_eq!(output, "ab");
}

#[test]
fn split_characters_are_joined() {
    let text = "é世".as_bytes();
    let (mut runtime, _) = setup(ScriptedProvider::new(move |call, _| {
        one_hot(text.get(call).copied().unwrap_or(0))
    }));
    assert_eq!(runtime.gen_completion("prompt", 16).unwrap(), "é世");
}

#[test]
fn dangling_bytes_are_flushed() {
    let text = "世".as_bytes();
    let (mut runtime, _) = setup(ScriptedProvider::new(move |call, _| {
        one_hot(text.get(call).copied().unwrap_or(0))
    }));
    assert_eq!(runtime.gen_completion("prompt", 2).unwrap(), "\u{fffd}");
}

#[test]
fn occurrences_decay_once_per_later_step() {
    let (mut runtime, _) = setup(ScriptedProvider::new(spell(b"abcdefgh")));
    runtime.set_penalty_params(PenaltyParams {
        presence_penalty: 0.0,
        frequency_penalty: 0.0,
        penalty_decay: 0.5,
    });

    let steps = 5;
    let output = runtime.gen_completion("prompt", steps).unwrap();
    assert_eq!(output, "abcde");

    let penalties = runtime.penalties();
    assert_eq!(penalties.get(b'a' as u32), Some(0.5f32.powi(steps as i32 - 1)));
    assert_eq!(penalties.get(b'b' as u32), Some(0.5f32.powi(steps as i32 - 2)));
    assert_eq!(penalties.get(b'e' as u32), Some(1.0));
}

#[test]
fn frequency_penalty_alternates_tokens() {
    let (mut runtime, _) = setup(ScriptedProvider::new(|_, _| {
        let mut logits = vec![0.0; NUM_VOCAB];
        logits[b'a' as usize] = 2.0;
        logits[b'b' as usize] = 1.5;
        logits
    }));
    runtime.set_penalty_params(PenaltyParams {
        presence_penalty: 0.0,
        frequency_penalty: 1.0,
        penalty_decay: 1.0,
    });
    assert_eq!(runtime.gen_completion("prompt", 3).unwrap(), "aba");
    assert_eq!(runtime.penalties().get(b'a' as u32), Some(2.0));
    assert_eq!(runtime.penalties().get(b'b' as u32), Some(1.0));
}

#[test]
fn clear_state_forgets_history() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"abc")));
    runtime.set_seed(11).unwrap();
    let params = runtime.sampler_params();
    runtime.gen_completion("prompt", 16).unwrap();
    assert_eq!(runtime.penalties().len(), 3);

    runtime.clear_state().unwrap();
    assert!(runtime.penalties().is_empty());
    assert_eq!(journal.lock().unwrap().clears, 1);
    assert_eq!(runtime.sampler_params(), params);
    assert_eq!(runtime.seed(), 11);
}

#[test]
fn components_are_initialized_once() {
    let (mut runtime, _) = setup(ScriptedProvider::new(spell(b"")));

    let err = runtime
        .init_with_provider(Box::new(ScriptedProvider::new(spell(b""))))
        .unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);

    let err = runtime.load_tokenizer_with(Box::new(AbcTokenizer)).unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);

    let err = runtime.load_model("assets/models/scripted.st").unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);
}

#[test]
fn operations_need_their_components() {
    let mut runtime = Runtime::new();
    let err = runtime.load_model("assets/models/scripted.st").unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);

    runtime
        .init_with_provider(Box::new(ScriptedProvider::new(spell(b"a"))))
        .unwrap();
    let mut logits = vec![0.0; NUM_VOCAB];
    let err = runtime.eval_logits(1, &mut logits).unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);

    runtime.load_model("assets/models/scripted.st").unwrap();
    let err = runtime.gen_completion("prompt", 4).unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);

    runtime.load_tokenizer_with(Box::new(AbcTokenizer)).unwrap();
    runtime.set_sampler_params(greedy());
    assert_eq!(runtime.gen_completion("prompt", 4).unwrap(), "a");
}

#[test]
fn logits_buffer_must_match_vocab() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"a")));
    assert_eq!(runtime.num_vocab(), NUM_VOCAB);

    let mut logits = vec![0.0; 10];
    let err = runtime.eval_logits(1, &mut logits).unwrap_err();
    assert_eq!(err.status(), Status::INVALID_PARAMETERS);
    let err = runtime.eval_logits_sequence(&[1, 2], &mut logits).unwrap_err();
    assert_eq!(err.status(), Status::INVALID_PARAMETERS);

    let mut logits = vec![0.0; NUM_VOCAB];
    let err = runtime.eval_logits_sequence(&[], &mut logits).unwrap_err();
    assert_eq!(err.status(), Status::INVALID_PARAMETERS);
    assert!(journal.lock().unwrap().evals.is_empty());

    runtime.eval_logits_sequence(&[1, 2], &mut logits).unwrap();
    assert_eq!(runtime.sample(&logits).unwrap(), b'a' as u32);
}

#[test]
fn same_seed_same_text() {
    let logits: Vec<f32> = {
        let mut rng = fastrand::Rng::with_seed(5);
        (0..NUM_VOCAB)
            .map(|token| match token {
                0 | 10 => -100.0,
                _ => rng.f32() * 4.0,
            })
            .collect()
    };
    let (mut runtime, _) = setup(ScriptedProvider::new(move |_, _| logits.clone()));
    runtime.set_sampler_params(SamplerParams {
        temperature: 1.2,
        top_k: 64,
        top_p: 0.9,
    });
    runtime.set_penalty_params(PenaltyParams::default());

    runtime.set_seed(2024).unwrap();
    let first = runtime.gen_completion("prompt", 24).unwrap();
    runtime.clear_state().unwrap();
    runtime.set_seed(2024).unwrap();
    let second = runtime.gen_completion("prompt", 24).unwrap();
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn failed_model_release_still_releases_backend() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"ab")).fail_release_model());
    let err = runtime.release().unwrap_err();
    assert_eq!(err.status(), Status::MODEL);
    assert!(journal.lock().unwrap().released);
    // the provider is kept, so the runtime still refuses a second init
    let err = runtime
        .init_with_provider(Box::new(ScriptedProvider::new(spell(b""))))
        .unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);
}

#[test]
fn release_needs_a_backend() {
    let mut runtime = Runtime::new();
    let err = runtime.release().unwrap_err();
    assert_eq!(err.status(), Status::RUNTIME | Status::INVALID_PARAMETERS);
}

#[test]
fn release_allows_init_again() {
    let (mut runtime, journal) = setup(ScriptedProvider::new(spell(b"ab")));
    runtime.release().unwrap();
    assert!(journal.lock().unwrap().released);
    assert_eq!(runtime.num_vocab(), 0);

    runtime
        .init_with_provider(Box::new(ScriptedProvider::new(spell(b"ba"))))
        .unwrap();
    runtime.load_model("assets/models/scripted.st").unwrap();
    assert_eq!(runtime.gen_completion("prompt", 8).unwrap(), "ba");
}

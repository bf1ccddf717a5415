use std::path::Path;

use derivative::Derivative;

use crate::{
    backend::{create_backend, BackendKind, BackendOptions, ExecutionProvider},
    sampler::{nucleus::NucleusSampler, penalty::Penalties, PenaltyParams, Sampler, SamplerParams},
    tokenizer::{Tokenizer, TrieTokenizer},
    Error, FinishReason, Result, Status, EOS_TOKEN,
};

/// Drives tokenization, evaluation, penalties and sampling for one caller.
///
/// A runtime is not meant to be shared between threads; use one per worker.
#[derive(Derivative)]
#[derivative(Debug, Default)]
pub struct Runtime {
    #[derivative(Debug = "ignore")]
    backend: Option<Box<dyn ExecutionProvider + Send>>,
    #[derivative(Debug = "ignore")]
    tokenizer: Option<Box<dyn Tokenizer + Send>>,
    #[derivative(Debug = "ignore")]
    sampler: Option<Box<dyn Sampler + Send>>,
    penalties: Penalties,
    sampler_params: SamplerParams,
    penalty_params: PenaltyParams,
    seed: u64,
    model_loaded: bool,
}

/// Moves every complete UTF-8 character of `pending` into `output`.
/// Bytes that can never become valid are replaced; an incomplete tail stays pending.
fn drain_utf8(pending: &mut Vec<u8>, output: &mut String) {
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                output.push_str(text);
                pending.clear();
                return;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                output.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match err.error_len() {
                    Some(invalid) => {
                        output.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + invalid);
                    }
                    None => {
                        pending.drain(..valid);
                        return;
                    }
                }
            }
        }
    }
}

fn check_logits(num_vocab: usize, logits: &[f32]) -> Result<()> {
    match logits.len() == num_vocab {
        true => Ok(()),
        false => Err(Error::new(
            Status::INVALID_PARAMETERS,
            format!(
                "logits buffer size mismatch: expected {num_vocab}, actual {}",
                logits.len()
            ),
        )),
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a built-in backend and initialize it with default options.
    pub fn init(&mut self, kind: BackendKind) -> Result<()> {
        self.init_with_options(kind, Default::default())
    }

    /// Select a backend by its name, `"web-rwkv"` or `"rwkv.cpp"`.
    pub fn init_with_name(&mut self, name: &str) -> Result<()> {
        let kind = name.parse()?;
        self.init(kind)
    }

    pub fn init_with_options(&mut self, kind: BackendKind, options: BackendOptions) -> Result<()> {
        self.ensure_uninit()?;
        let backend = create_backend(kind, options)?;
        self.init_with_provider(backend)?;
        log::info!("[runtime][init] {kind}");
        Ok(())
    }

    /// Install a caller-supplied execution provider.
    pub fn init_with_provider(&mut self, mut backend: Box<dyn ExecutionProvider + Send>) -> Result<()> {
        self.ensure_uninit()?;
        backend.init()?;

        let seed = match self.sampler {
            Some(_) => self.seed,
            None => fastrand::u64(..),
        };
        self.backend = Some(backend);
        self.sampler = Some(Box::new(NucleusSampler::new(seed)));
        self.seed = seed;
        Ok(())
    }

    fn ensure_uninit(&self) -> Result<()> {
        match self.backend {
            Some(_) => Err(Error::new(
                Status::RUNTIME | Status::INVALID_PARAMETERS,
                "backend already initialized",
            )),
            None => Ok(()),
        }
    }

    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or_else(|| Error::not_ready("backend"))?;
        if self.model_loaded {
            return Err(Error::new(
                Status::RUNTIME | Status::INVALID_PARAMETERS,
                "model already loaded",
            ));
        }
        backend.load_model(path.as_ref())?;
        self.model_loaded = true;
        log::info!(
            "[runtime][load] {} (vocab {})",
            path.as_ref().display(),
            backend.num_vocab()
        );
        Ok(())
    }

    /// Load the world vocabulary from a JSON file.
    pub fn load_tokenizer(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_no_tokenizer()?;
        let tokenizer = TrieTokenizer::load(path)?;
        self.tokenizer = Some(Box::new(tokenizer));
        Ok(())
    }

    pub fn load_tokenizer_with(&mut self, tokenizer: Box<dyn Tokenizer + Send>) -> Result<()> {
        self.ensure_no_tokenizer()?;
        self.tokenizer = Some(tokenizer);
        Ok(())
    }

    fn ensure_no_tokenizer(&self) -> Result<()> {
        match self.tokenizer {
            Some(_) => Err(Error::new(
                Status::RUNTIME | Status::INVALID_PARAMETERS,
                "tokenizer already loaded",
            )),
            None => Ok(()),
        }
    }

    fn provider(&mut self) -> Result<&mut (dyn ExecutionProvider + Send + 'static)> {
        if !self.model_loaded {
            return Err(Error::not_ready("model"));
        }
        self.backend
            .as_deref_mut()
            .ok_or_else(|| Error::not_ready("backend"))
    }

    fn tokenizer(&self) -> Result<&(dyn Tokenizer + Send)> {
        self.tokenizer
            .as_deref()
            .ok_or_else(|| Error::not_ready("tokenizer"))
    }

    fn sampler(&mut self) -> Result<&mut (dyn Sampler + Send + 'static)> {
        self.sampler
            .as_deref_mut()
            .ok_or_else(|| Error::not_ready("sampler"))
    }

    /// Vocabulary size of the loaded model, or 0 if there is none.
    pub fn num_vocab(&self) -> usize {
        match (&self.backend, self.model_loaded) {
            (Some(backend), true) => backend.num_vocab(),
            _ => 0,
        }
    }

    pub fn eval_logits(&mut self, token: u32, logits: &mut [f32]) -> Result<()> {
        let backend = self.provider()?;
        check_logits(backend.num_vocab(), logits)?;
        backend.eval(token, logits)
    }

    pub fn eval_logits_sequence(&mut self, tokens: &[u32], logits: &mut [f32]) -> Result<()> {
        let backend = self.provider()?;
        if tokens.is_empty() {
            return Err(Error::new(Status::INVALID_PARAMETERS, "input cannot be empty"));
        }
        check_logits(backend.num_vocab(), logits)?;
        backend.eval_sequence(tokens, logits)
    }

    /// A chat turn: the prompt is `"<user_role>: <user_input>\n\n<response_role>:"`.
    pub fn chat(
        &mut self,
        user_role: &str,
        response_role: &str,
        user_input: &str,
        max_length: usize,
    ) -> Result<String> {
        let prompt = format!("{user_role}: {user_input}\n\n{response_role}:");
        let mut response = String::new();
        self.generate(&prompt, max_length, &mut response)?;
        Ok(response)
    }

    pub fn gen_completion(&mut self, prompt: &str, length: usize) -> Result<String> {
        let mut completion = String::new();
        self.generate(prompt, length, &mut completion)?;
        Ok(completion)
    }

    /// Prime on `prompt` and decode at most `max_tokens` tokens into `output`.
    ///
    /// On failure `output` keeps whatever was decoded before the error, which is not a
    /// complete response.
    pub fn generate(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        output: &mut String,
    ) -> Result<FinishReason> {
        let mut pending = Vec::new();
        let start = output.len();
        let result = self.decode_loop(prompt, max_tokens, &mut pending, output, start);
        if !pending.is_empty() {
            output.push_str(&String::from_utf8_lossy(&pending));
        }

        match &result {
            Ok(reason) => log::info!(
                "[generate][done] {:?}: {} bytes",
                reason,
                output.len() - start
            ),
            Err(err) => log::warn!("[generate][abort] {err}"),
        }
        result
    }

    fn decode_loop(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        pending: &mut Vec<u8>,
        output: &mut String,
        start: usize,
    ) -> Result<FinishReason> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or_else(|| Error::not_ready("backend"))?;
        if !self.model_loaded {
            return Err(Error::not_ready("model"));
        }
        let tokenizer = self
            .tokenizer
            .as_deref()
            .ok_or_else(|| Error::not_ready("tokenizer"))?;
        let sampler = self
            .sampler
            .as_deref_mut()
            .ok_or_else(|| Error::not_ready("sampler"))?;
        let penalties = &mut self.penalties;
        let sampler_params = &self.sampler_params;
        let penalty_params = &self.penalty_params;

        let tokens = tokenizer.encode(prompt)?;
        if tokens.is_empty() {
            return Err(Error::new(
                Status::EVAL | Status::INVALID_PARAMETERS,
                "prompt encodes to no tokens",
            ));
        }
        let mut logits = vec![0.0; backend.num_vocab()];
        backend.eval_sequence(&tokens, &mut logits)?;
        log::info!("[generate][prime] {} tokens", tokens.len());

        for _ in 0..max_tokens {
            penalties.transform(penalty_params, &mut logits);
            let token = sampler.sample(&logits, sampler_params)?;
            if token == EOS_TOKEN {
                return Ok(FinishReason::Stop);
            }
            penalties.update(token);

            pending.extend(tokenizer.decode_bytes(&[token])?);
            drain_utf8(pending, output);
            // only text appended by this call counts toward the blank line
            if output[start..].ends_with("\n\n") {
                return Ok(FinishReason::Stop);
            }

            backend.eval(token, &mut logits)?;
        }
        Ok(FinishReason::Length)
    }

    /// Draw a token from `logits` with the current sampler parameters.
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        let params = self.sampler_params;
        self.sampler()?.sample(logits, &params)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.tokenizer()?.encode(text)
    }

    pub fn decode(&self, token: u32) -> Result<String> {
        self.tokenizer()?.decode(token)
    }

    pub fn decode_all(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer()?.decode_all(tokens)
    }

    pub fn sampler_params(&self) -> SamplerParams {
        self.sampler_params
    }

    pub fn set_sampler_params(&mut self, params: SamplerParams) {
        self.sampler_params = params;
    }

    pub fn penalty_params(&self) -> PenaltyParams {
        self.penalty_params
    }

    pub fn set_penalty_params(&mut self, params: PenaltyParams) {
        self.penalty_params = params;
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Reseed the sampler. Its random sequence restarts from `seed`.
    pub fn set_seed(&mut self, seed: u64) -> Result<()> {
        self.sampler()?.set_seed(seed);
        self.seed = seed;
        Ok(())
    }

    /// Occurrence counts accumulated by generation so far.
    pub fn penalties(&self) -> &Penalties {
        &self.penalties
    }

    pub fn get_state(&mut self) -> Result<Vec<f32>> {
        self.provider()?.get_state()
    }

    pub fn set_state(&mut self, state: &[f32]) -> Result<()> {
        self.provider()?.set_state(state)
    }

    /// Forget generation history. Parameters and the seed are kept.
    pub fn clear_state(&mut self) -> Result<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or_else(|| Error::not_ready("backend"))?;
        self.penalties.clear();
        if self.model_loaded {
            backend.clear_state()?;
        }
        log::info!("[runtime][clear]");
        Ok(())
    }

    /// Release the model and the backend. The runtime may be initialized again afterwards.
    ///
    /// Both the model and the backend release run even if the first fails. On failure the
    /// provider is kept.
    pub fn release(&mut self) -> Result<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or_else(|| Error::not_ready("backend"))?;
        match (backend.release_model(), backend.release()) {
            (Ok(()), Ok(())) => {}
            (Err(err), Ok(())) | (Ok(()), Err(err)) => return Err(err),
            (Err(first), Err(second)) => {
                return Err(Error::new(
                    first.status() | second.status(),
                    format!("{}; {}", first.message(), second.message()),
                ))
            }
        }
        self.backend = None;
        self.model_loaded = false;
        log::info!("[runtime][release]");
        Ok(())
    }
}

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{bail, Result};
use derivative::Derivative;
use half::f16;
use memmap2::Mmap;
use safetensors::SafeTensors;
use web_rwkv::{
    context::{Context, ContextBuilder, InstanceExt},
    runtime::{
        infer::{Rnn, RnnInput, RnnInputBatch, RnnOption},
        loader::Loader,
        model::{Bundle, ContextAutoLimits, ModelBuilder, ModelInfo, ModelVersion, Quant, State},
        v4, v5, v6, Runtime, TokioRuntime,
    },
    tensor::TensorShape,
    wgpu::{Backends, PowerPreference},
};

use super::{AdapterOption, BackendOptions, ExecutionProvider};
use crate::{error::StatusExt, Error, Status};

/// Rescale interval large enough to cover every layer.
const RESCALE_ALL: usize = 999;

/// List GPU adapters as `"<name> (<backend>)"`.
pub fn adapters() -> Vec<String> {
    let instance = web_rwkv::wgpu::Instance::default();
    instance
        .enumerate_adapters(Backends::all())
        .into_iter()
        .map(|adapter| adapter.get_info())
        .map(|info| format!("{} ({:?})", info.name, info.backend))
        .collect()
}

async fn create_context(adapter: AdapterOption, info: &ModelInfo) -> Result<Context> {
    let instance = web_rwkv::wgpu::Instance::default();
    let adapter = match adapter {
        AdapterOption::Auto => instance.adapter(PowerPreference::HighPerformance).await,
        AdapterOption::Economical => instance.adapter(PowerPreference::LowPower).await,
        AdapterOption::Manual(selection) => Ok(instance
            .enumerate_adapters(Backends::all())
            .into_iter()
            .nth(selection)
            .ok_or(web_rwkv::context::ContextError::RequestAdapterFailed)?),
    }?;
    let context = ContextBuilder::new(adapter)
        .auto_limits(info)
        .build()
        .await?;
    Ok(context)
}

/// Music models are unstable in half precision unless every layer is rescaled.
fn guess_rescale(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    (name.contains("abc") || name.contains("midi")).then_some(RESCALE_ALL)
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Loaded {
    #[derivative(Debug = "ignore")]
    context: Context,
    info: ModelInfo,
    #[derivative(Debug = "ignore")]
    runtime: Arc<dyn Runtime<Rnn> + Send + Sync>,
    #[derivative(Debug = "ignore")]
    state: Arc<dyn State + Send + Sync>,
}

async fn load_model(path: &Path, options: &BackendOptions) -> Result<Loaded> {
    let file = std::fs::File::open(path)?;
    let data = unsafe { Mmap::map(&file)? };

    let model = SafeTensors::deserialize(&data)?;
    let info = Loader::info(&model)?;
    log::info!("{:#?}", info);

    let context = create_context(options.adapter, &info).await?;
    log::info!("{:#?}", context.adapter.get_info());

    let quant: HashMap<usize, Quant> = (0..options.quant)
        .map(|layer| (layer, Quant::Int8))
        .chain((0..options.quant_nf4).map(|layer| (layer, Quant::NF4)))
        .collect();
    let builder = ModelBuilder::new(&context, model).quant(quant);
    let builder = match options.rescale.or_else(|| guess_rescale(path)) {
        Some(rescale) => builder.rescale(rescale),
        None => builder,
    };

    macro_rules! build_bundle {
        ($version:expr, { $(($variant:path, $build:ident, $bundle:ty)),+ }) => {
            match $version {
                $(
                    $variant => {
                        let model = builder.$build().await?;
                        let bundle = <$bundle>::new(model, 1);
                        let state: Arc<dyn State + Send + Sync> = Arc::new(bundle.state());
                        let runtime: TokioRuntime<Rnn> = TokioRuntime::new(bundle).await;
                        let runtime: Arc<dyn Runtime<Rnn> + Send + Sync> = Arc::new(runtime);
                        (runtime, state)
                    }
                )+
                version => bail!("unsupported version: {:?}", version),
            }
        };
    }
    let (runtime, state) = build_bundle!(info.version, {
        (ModelVersion::V4, build_v4, v4::Bundle::<f16>),
        (ModelVersion::V5, build_v5, v5::Bundle::<f16>),
        (ModelVersion::V6, build_v6, v6::Bundle::<f16>)
    });

    Ok(Loaded {
        context,
        info,
        runtime,
        state,
    })
}

async fn infer(loaded: &Loaded, tokens: Vec<u32>, token_chunk_size: usize) -> Result<Vec<f32>> {
    let batch = RnnInputBatch::new(tokens, RnnOption::Last);
    let mut input = RnnInput::new(vec![batch], token_chunk_size);
    loop {
        let (next, output) = loaded.runtime.infer(input).await?;
        input = next;

        let output = output[0].0.clone();
        if !output.is_empty() {
            break Ok(output.to_vec());
        }
        if input.num_token() == 0 {
            bail!("inference finished without output");
        }
    }
}

/// The portable compute-shader backend. Owns a private async runtime and blocks on it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRwkvBackend {
    options: BackendOptions,
    #[derivative(Debug = "ignore")]
    tokio: Option<tokio::runtime::Runtime>,
    model: Option<Loaded>,
}

impl WebRwkvBackend {
    pub fn new(options: BackendOptions) -> Self {
        Self {
            options,
            tokio: None,
            model: None,
        }
    }

    pub fn info(&self) -> Option<&ModelInfo> {
        self.model.as_ref().map(|model| &model.info)
    }

    fn tokio(&self) -> crate::Result<&tokio::runtime::Runtime> {
        self.tokio
            .as_ref()
            .ok_or_else(|| Error::new(Status::BACKEND | Status::INIT, "backend not initialized"))
    }

    fn loaded(&self) -> crate::Result<(&tokio::runtime::Runtime, &Loaded)> {
        let tokio = self.tokio()?;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::new(Status::MODEL, "model not loaded"))?;
        Ok((tokio, model))
    }
}

impl ExecutionProvider for WebRwkvBackend {
    fn init(&mut self) -> crate::Result<()> {
        if self.tokio.is_some() {
            return Err(Error::new(
                Status::INIT | Status::INVALID_PARAMETERS,
                "backend already initialized",
            ));
        }
        let tokio = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .status(Status::INIT | Status::BACKEND)?;
        self.tokio = Some(tokio);
        log::info!("[backend][init] web-rwkv");
        Ok(())
    }

    fn load_model(&mut self, path: &Path) -> crate::Result<()> {
        if !path.exists() {
            return Err(Error::new(
                Status::MODEL | Status::IO,
                format!("model not found: {}", path.display()),
            ));
        }
        let tokio = self.tokio()?;
        log::info!("[backend][load] {}", path.display());
        let loaded = tokio
            .block_on(load_model(path, &self.options))
            .status(Status::MODEL)?;
        self.model = Some(loaded);
        Ok(())
    }

    fn num_vocab(&self) -> usize {
        self.info().map(|info| info.num_vocab).unwrap_or_default()
    }

    fn eval_sequence(&mut self, tokens: &[u32], logits: &mut [f32]) -> crate::Result<()> {
        if tokens.is_empty() {
            return Err(Error::new(
                Status::EVAL | Status::INVALID_PARAMETERS,
                "input cannot be empty",
            ));
        }
        let (tokio, loaded) = self.loaded().map_err(|err| {
            Error::new(err.status() | Status::EVAL, err.message().to_string())
        })?;
        let output = tokio
            .block_on(infer(loaded, tokens.to_vec(), self.options.token_chunk_size))
            .status(Status::EVAL)?;
        if output.len() != logits.len() {
            return Err(Error::new(
                Status::EVAL | Status::INVALID_PARAMETERS,
                format!(
                    "output buffer size mismatch: expected {}, actual {}",
                    output.len(),
                    logits.len()
                ),
            ));
        }
        logits.copy_from_slice(&output);
        Ok(())
    }

    fn get_state(&self) -> crate::Result<Vec<f32>> {
        let (tokio, loaded) = self.loaded()?;
        let state = tokio.block_on(loaded.state.back(0)).status(Status::BACKEND)?;
        Ok(state.to_vec())
    }

    fn set_state(&mut self, data: &[f32]) -> crate::Result<()> {
        let (_, loaded) = self.loaded()?;
        let init = loaded.state.init();
        if init.len() != data.len() {
            return Err(Error::new(
                Status::INVALID_PARAMETERS,
                format!("state size mismatch: expected {}, actual {}", init.len(), data.len()),
            ));
        }
        let tensor = loaded
            .context
            .tensor_from_data(init.shape(), data.to_vec())
            .status(Status::BACKEND)?;
        loaded.state.load(tensor, 0).status(Status::BACKEND)
    }

    fn clear_state(&mut self) -> crate::Result<()> {
        let (_, loaded) = self.loaded()?;
        let tensor = loaded.state.init();
        loaded.state.load(tensor, 0).status(Status::BACKEND)
    }

    fn release_model(&mut self) -> crate::Result<()> {
        if self.model.take().is_some() {
            log::info!("[backend][release] model");
        }
        Ok(())
    }

    fn release(&mut self) -> crate::Result<()> {
        self.model = None;
        if let Some(tokio) = self.tokio.take() {
            tokio.shutdown_background();
            log::info!("[backend][release] web-rwkv");
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        !adapters().is_empty()
    }
}

//! flaxport model conversion
//!
//! Moves Falcon checkpoints between the PyTorch state-dict layout
//! (dotted names, `(out, in)` projection matrices) and the Flax parameter
//! tree layout (path keys, `(in, out)` kernels).
//!
//! Checkpoint shards are memory-mapped, but every tensor is copied out of
//! the mapping into an owned buffer on load, and a conversion produces a
//! second owned copy. Peak memory is therefore about twice the checkpoint
//! size, plus the mapped pages while the loader is alive.

mod config;
mod convert;
mod error;
mod loader;
mod naming;
mod params;
mod registry;
mod tensor;

pub use config::{FalconConfig, RuntimeArgs, CHECKPOINT_POLICIES};
pub use convert::{flax_to_pt, pt_to_flax, ConvertOptions};
pub use error::{ModelError, Result, INCOMPATIBLE_WEIGHTS_HINT};
pub use loader::{
    list_safetensor_files, load_flat, load_nested, save_flat, save_nested, SafetensorsLoader,
};
pub use naming::{expected_param_count, ParamKind, ParamSpec, HEAD_PARAMS, LAYER_PARAMS, TAIL_PARAMS};
pub use params::{FlatParams, IndexBounds, NestedParams, ParamPath, PATH_SEPARATOR};
pub use registry::{from_pretrained, LocalRegistry, ModelRegistry};
pub use tensor::{DType, Device, Tensor};

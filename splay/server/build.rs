use anyhow::{Result, format_err};
use shadow_rs::ShadowBuilder;

fn main() -> Result<()> {
    ShadowBuilder::builder()
        .build()
        .map(|_| ())
        .map_err(|e| format_err!("inject build-time variables: {:?}", e))
}

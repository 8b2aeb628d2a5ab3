//! Emits both CRD manifests (spec §3 schemas) as YAML, one document per
//! kind, separated by `---`, so `kubectl apply -f <(nixops-crdgen)` installs
//! both in one shot. Grounded in the pack's
//! `print_crd_without_formats`/`CustomResourceExt::crd()` pattern.

use kube::CustomResourceExt;
use nixops_resource::{Machine, NixosConfiguration};

fn strip_format_keys(v: &mut serde_json::Value) {
    use serde_json::Value::*;
    match v {
        Object(map) => {
            map.remove("format");
            for val in map.values_mut() {
                strip_format_keys(val);
            }
        }
        Array(arr) => {
            for val in arr {
                strip_format_keys(val);
            }
        }
        _ => {}
    }
}

fn print_crd<T: CustomResourceExt>() -> anyhow::Result<()> {
    let crd = T::crd();
    let mut v = serde_json::to_value(&crd)?;
    strip_format_keys(&mut v);
    println!("---");
    println!("{}", serde_yaml::to_string(&v)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    print_crd::<Machine>()?;
    print_crd::<NixosConfiguration>()?;
    Ok(())
}

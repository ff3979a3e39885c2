//! Print the DynamicOperator CRD as YAML, for `kubectl apply -f -`.

use kube::CustomResourceExt;

use trellis_operator::crd::DynamicOperator;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&DynamicOperator::crd()).expect("CRD serialises to YAML")
    );
}

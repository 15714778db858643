use kube::CustomResourceExt;
use opensearch_operator::crd::OpenSearchService;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&OpenSearchService::crd())?);
    Ok(())
}

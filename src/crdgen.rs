use db_controller::resources::{mongodb, postgresql};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let documents = vec![
        mongodb::database::MongoDBDatabase::crd(),
        mongodb::user::MongoDBUser::crd(),
        postgresql::database::PostgreSQLDatabase::crd(),
        postgresql::user::PostgreSQLUser::crd(),
    ];

    for document in documents {
        print!("---\n");
        print!("{}", serde_yaml::to_string(&document)?);
    }
    Ok(())
}

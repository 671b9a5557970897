use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

pub async fn run(namespace: &str) -> anyhow::Result<()> {
    println!("Running sandbox control plane connectivity checks against namespace '{namespace}'...\n");

    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {e}");
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    print!("  List sandbox pods permission  ");
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  Create/patch/delete pods ....  ");
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK (list-only probe; write permissions assumed from RBAC role)"),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  Get/create/patch leases ......  ");
    let leases: Api<Lease> = Api::namespaced(client, namespace);
    match leases.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\nAll checks completed.");
    Ok(())
}

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::env;
use std::path::PathBuf;

use scalenet::activation::Activation;
use scalenet::data::cifar10::{Cifar10Dataset, DataLoader};
use scalenet::nn::Module;
use scalenet::optim::{MultiStepLR, SGD};
use scalenet::resnet::{build_resnet, DenseConvs, NetworkConfig, Variant};
use scalenet::{make_scalenet, QuantSpec, ScaleNetConfig, Trainer};

struct Args {
    depth: usize,
    epochs: usize,
    batch_size: usize,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    input_bits: u32,
    scale_bits: u32,
    activation: Activation,
    data_dir: Option<String>,
    pretrained: Option<PathBuf>,
    save: Option<PathBuf>,
    origin: bool,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            depth: 18,
            epochs: 500,
            batch_size: 256,
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
            input_bits: 32,
            scale_bits: 16,
            activation: Activation::Relu,
            data_dir: None,
            pretrained: None,
            save: None,
            origin: false,
        }
    }
}

fn usage() -> ! {
    println!("ScaleNet CIFAR-10 training");
    println!();
    println!("Options:");
    println!("  --depth N          ResNet depth: 18/34/50/101/152 (default 18)");
    println!("  --epochs N         training epochs (default 500)");
    println!("  --batch-size N     mini-batch size (default 256)");
    println!("  --lr F             initial learning rate (default 0.1)");
    println!("  --momentum F       SGD momentum (default 0.9)");
    println!("  --weight-decay F   L2 weight decay (default 1e-4)");
    println!("  --input-bits N     activation bits: 32 = off, 16 = half, else linear (default 32)");
    println!("  --scale-bits N     scale bits: 16 = half, else decimal digits (default 16)");
    println!("  --activation A     relu | tanh | htanh (default relu)");
    println!("  --data-dir PATH    extracted cifar-10-batches-bin directory");
    println!("  --pretrained PATH  checkpoint loaded positionally into the parent");
    println!("  --save PATH        write checkpoints here each epoch");
    println!("  --origin           train the plain float network instead");
    std::process::exit(0);
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut it = env::args().skip(1);

    while let Some(flag) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .unwrap_or_else(|| panic!("missing value for {}", name))
        };
        match flag.as_str() {
            "--depth" => args.depth = value("--depth").parse().expect("bad --depth"),
            "--epochs" => args.epochs = value("--epochs").parse().expect("bad --epochs"),
            "--batch-size" => {
                args.batch_size = value("--batch-size").parse().expect("bad --batch-size")
            }
            "--lr" => args.lr = value("--lr").parse().expect("bad --lr"),
            "--momentum" => args.momentum = value("--momentum").parse().expect("bad --momentum"),
            "--weight-decay" => {
                args.weight_decay = value("--weight-decay").parse().expect("bad --weight-decay")
            }
            "--input-bits" => {
                args.input_bits = value("--input-bits").parse().expect("bad --input-bits")
            }
            "--scale-bits" => {
                args.scale_bits = value("--scale-bits").parse().expect("bad --scale-bits")
            }
            "--activation" => {
                let name = value("--activation");
                args.activation =
                    Activation::parse(&name).unwrap_or_else(|| panic!("bad --activation {}", name));
            }
            "--data-dir" => args.data_dir = Some(value("--data-dir")),
            "--pretrained" => args.pretrained = Some(PathBuf::from(value("--pretrained"))),
            "--save" => args.save = Some(PathBuf::from(value("--save"))),
            "--origin" => args.origin = true,
            "--help" | "-h" => usage(),
            other => panic!("unknown flag {} (try --help)", other),
        }
    }

    args
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    println!("ScaleNet Training");
    println!(
        "ResNet-{} | input bits: {} | scale bits: {} | {}",
        args.depth,
        args.input_bits,
        args.scale_bits,
        if args.origin { "float baseline" } else { "quantized" }
    );
    println!();

    let train_dataset = Cifar10Dataset::new(true, args.data_dir.as_deref())?;
    let test_dataset = Cifar10Dataset::new(false, args.data_dir.as_deref())?;
    let mut train_loader = DataLoader::new(train_dataset, args.batch_size, true);
    let mut test_loader = DataLoader::new(test_dataset, 500, false);

    let network = NetworkConfig {
        depth: args.depth,
        num_classes: 10,
        variant: Variant::Cifar,
        activation: args.activation,
    };

    let model: Box<dyn Module> = if args.origin {
        Box::new(build_resnet(&network, &DenseConvs))
    } else {
        let mut config = ScaleNetConfig::new(
            network,
            QuantSpec {
                activation_bits: args.input_bits,
                scale_bits: args.scale_bits,
            },
        );
        config.pretrained = args.pretrained.clone();

        let (net, report) = make_scalenet(&config)?;
        println!(
            "Transplanted {} conv sites ({} state tensors copied, {} skipped)",
            report.sites, report.copied, report.skipped
        );
        Box::new(net)
    };

    let total_params: usize = model.parameters().iter().map(|p| p.len()).sum();
    println!("Trainable parameters: {}\n", total_params);

    let optimizer = SGD::new(model.parameters(), args.lr, args.momentum, args.weight_decay);
    let scheduler = MultiStepLR::new(args.lr, vec![120, 240, 400], 0.1);

    let mut trainer = Trainer::new(model, Box::new(optimizer), Some(Box::new(scheduler)));
    trainer.fit(
        &mut train_loader,
        &mut test_loader,
        args.epochs,
        args.save.as_deref(),
    );

    Ok(())
}

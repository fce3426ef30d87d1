//! Restricted-Mode Compartment Demo
//!
//! Boots the machine, drops into the root compartment (id 0) and
//! exercises direct calls, indirect calls through a function
//! capability, sibling compartments and a nested compartment call.

use caprock::{CallArgs, CmptFlags, Machine, RegValue, Result};

/// Target summing two integers, reporting where it runs.
fn sum(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
    let cid = m.compartment_id();
    println!("[{}] csp: {}", cid, m.csp());
    println!("[{}] pcc: {}", cid, m.pcc());
    Ok(RegValue::Int(args.int(0) + args.int(1)))
}

/// Target that forwards its two integers into another compartment
/// whose entry capability arrives in the first argument register.
fn sum_with_nested_cmpt(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
    let cid = m.compartment_id();
    println!("[{}] csp: {}", cid, m.csp());
    println!("[{}] pcc: {}", cid, m.pcc());
    let cmpt = args.cap(0);
    let inner = CallArgs::of(&[RegValue::Int(args.int(1)), RegValue::Int(args.int(2))]);
    m.call(&cmpt, &inner)
}

/// Restricted main, running in the root compartment. Functions
/// invoked directly stay in this compartment; anything invoked via a
/// compartment entry runs on its own private stack.
fn rmain(m: &mut Machine, _args: &CallArgs) -> Result<RegValue> {
    println!("[{}] hello restricted mode", m.compartment_id());

    let two_three = CallArgs::of(&[RegValue::Int(2), RegValue::Int(3)]);

    // Direct calls just work: they inherit the current context.
    println!("2 + 3 = {}", sum(m, &two_three)?.as_int());

    // Indirect call through a function capability; still the root
    // compartment, but the branch goes through the machine.
    let fnp = m.register_function(sum)?;
    println!("2 + 3 = {}", m.call(&fnp, &two_three)?.as_int());

    // The same function behind a compartment entry.
    let cmp0 = m.create_compartment(&fnp, 2, CmptFlags::default())?;
    println!("2 + 3 = {}", m.call(&cmp0, &two_three)?.as_int());

    // A second compartment gets the next sequential id.
    let cmp1 = m.create_compartment(&fnp, 3, CmptFlags::default())?;
    println!("2 + 3 = {}", m.call(&cmp1, &two_three)?.as_int());

    // Nested compartments: cmp2 calls into cmp0 from inside.
    let nested = m.register_function(sum_with_nested_cmpt)?;
    let cmp2 = m.create_compartment(&nested, 1, CmptFlags::default())?;
    let args = CallArgs::of(&[
        RegValue::Cap(cmp0),
        RegValue::Int(3),
        RegValue::Int(8),
    ]);
    println!("3 + 8 = {}", m.call(&cmp2, &args)?.as_int());

    Ok(RegValue::Int(0))
}

fn run() -> Result<()> {
    let mut m = Machine::new();
    let main_fn = m.register_function(rmain)?;
    m.run_restricted(&main_fn, &CallArgs::new())?;
    Ok(())
}

fn main() {
    caprock::logger::init(log::LevelFilter::Debug);
    if let Err(fault) = run() {
        eprintln!("restricted: {}", fault);
        std::process::exit(1);
    }
}

use std::collections::HashMap;
use std::fmt;

use crate::dso::{is_jit_symfile_path, DsoType, Symbol};
use crate::thread_tree::{DsoId, MapEntry, ThreadEntry, ThreadTree};

/// Trampolines through which the runtime enters native code of JNI methods.
static ART_JNI_SYMBOLS: &[&str] = &[
    "art_jni_trampoline",
    "art_quick_generic_jni_trampoline",
    "art_jni_dlsym_lookup_stub",
    "art_jni_dlsym_lookup_critical_stub"
];

const JIT_CACHE_DSO_NAME: &str = "[JIT cache]";

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CallChainExecutionType {
    Native,
    InterpretedJvm,
    JitJvm,
    ArtJni,
    /// Code of the runtime itself executing on behalf of a Java method.
    ArtMethod
}

impl CallChainExecutionType {
    pub fn as_str( &self ) -> &'static str {
        match *self {
            CallChainExecutionType::Native => "native",
            CallChainExecutionType::InterpretedJvm => "interpreted_jvm",
            CallChainExecutionType::JitJvm => "jit_jvm",
            CallChainExecutionType::ArtJni => "art_jni",
            CallChainExecutionType::ArtMethod => "art_method"
        }
    }
}

impl fmt::Display for CallChainExecutionType {
    fn fmt( &self, fmt: &mut fmt::Formatter ) -> fmt::Result {
        write!( fmt, "{}", self.as_str() )
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct CallChainReportEntry {
    pub ip: u64,
    pub symbol: Option< Symbol >,
    pub dso: DsoId,
    pub dso_name: String,
    pub vaddr_in_file: u64,
    pub map: MapEntry,
    pub execution_type: CallChainExecutionType
}

impl CallChainReportEntry {
    pub fn symbol_name( &self ) -> &str {
        self.symbol.as_ref().map( |symbol| symbol.name() ).unwrap_or( "unknown" )
    }
}

fn is_art_library( path: &str ) -> bool {
    path.ends_with( "/libart.so" ) || path.ends_with( "/libartd.so" )
}

/// Turns raw instruction pointers into resolved frames, hiding the runtime's own frames around Java code.
pub struct CallChainReportBuilder {
    remove_art_frame: bool,
    convert_jit_frame: bool,
    java_methods: Option< HashMap< String, (DsoId, Symbol) > >
}

impl Default for CallChainReportBuilder {
    fn default() -> Self {
        CallChainReportBuilder::new()
    }
}

impl CallChainReportBuilder {
    pub fn new() -> Self {
        CallChainReportBuilder {
            remove_art_frame: true,
            convert_jit_frame: true,
            java_methods: None
        }
    }

    pub fn set_remove_art_frame( &mut self, value: bool ) {
        self.remove_art_frame = value;
    }

    pub fn set_convert_jit_frame( &mut self, value: bool ) {
        self.convert_jit_frame = value;
    }

    /// Resolves `ips`, innermost frame first; the first `kernel_ip_count` of them are kernel addresses.
    pub fn build( &mut self, tree: &mut ThreadTree, thread: &ThreadEntry, ips: &[u64], kernel_ip_count: usize ) -> Vec< CallChainReportEntry > {
        let mut callchain = Vec::with_capacity( ips.len() );
        for (index, &ip) in ips.iter().enumerate() {
            let map = tree.find_map( thread, ip, index < kernel_ip_count );
            let (symbol, vaddr_in_file) = tree.find_symbol( &map, ip );
            let dso = tree.dso( map.dso );
            let is_jni_trampoline = symbol.as_ref().map( |symbol| ART_JNI_SYMBOLS.contains( &symbol.name() ) ).unwrap_or( false );
            let execution_type = if is_jni_trampoline {
                CallChainExecutionType::ArtJni
            } else if dso.is_for_java_method() {
                if dso.kind() == DsoType::DexFile {
                    CallChainExecutionType::InterpretedJvm
                } else {
                    CallChainExecutionType::JitJvm
                }
            } else {
                CallChainExecutionType::Native
            };

            callchain.push( CallChainReportEntry {
                ip,
                symbol,
                dso: map.dso,
                dso_name: dso.path().to_owned(),
                vaddr_in_file,
                map,
                execution_type
            });
        }

        mark_art_frames( tree, &mut callchain );
        if self.remove_art_frame {
            callchain.retain( |entry| entry.execution_type != CallChainExecutionType::ArtMethod );
        }

        if self.convert_jit_frame {
            self.convert_jit_frames( tree, &mut callchain );
        }

        callchain
    }

    fn collect_java_methods( &mut self, tree: &mut ThreadTree ) -> &HashMap< String, (DsoId, Symbol) > {
        self.java_methods.get_or_insert_with( || {
            let mut java_methods = HashMap::new();
            let dex_dsos: Vec< DsoId > = tree.dso_ids().filter( |&id| tree.dso( id ).kind() == DsoType::DexFile ).collect();
            for id in dex_dsos {
                for symbol in tree.dso_mut( id ).symbols() {
                    java_methods.entry( symbol.name().to_owned() ).or_insert_with( || (id, symbol.clone()) );
                }
            }

            debug!( "Collected {} Java methods", java_methods.len() );
            java_methods
        })
    }

    /// Makes a JIT compiled method look like its interpreted counterpart.
    fn convert_jit_frames( &mut self, tree: &mut ThreadTree, callchain: &mut Vec< CallChainReportEntry > ) {
        let java_methods = self.collect_java_methods( tree );
        let mut index = 0;
        while index < callchain.len() {
            let dso = tree.dso( callchain[ index ].dso );
            if dso.kind() != DsoType::ElfFile || !dso.is_for_java_method() {
                index += 1;
                continue;
            }

            let interpreted = callchain[ index ].symbol.as_ref().and_then( |symbol| java_methods.get( symbol.name() ) );
            match interpreted {
                Some( &(dex_dso, ref dex_symbol) ) => {
                    let entry = &mut callchain[ index ];
                    entry.dso = dex_dso;
                    entry.dso_name = tree.dso( dex_dso ).path().to_owned();
                    entry.symbol = Some( dex_symbol.clone() );

                    // An offset inside JIT code can't be mapped back into the dex file.
                    entry.vaddr_in_file = dex_symbol.addr;

                    // The interpreter may call into the JIT code of the very same method.
                    let is_self_call = callchain.get( index + 1 )
                        .map( |next| next.dso == dex_dso && next.symbol.as_ref() == Some( dex_symbol ) )
                        .unwrap_or( false );

                    if is_self_call {
                        callchain.remove( index );
                        continue;
                    }
                },
                None => {
                    if !is_jit_symfile_path( dso.path() ) {
                        callchain[ index ].dso_name = JIT_CACHE_DSO_NAME.to_owned();
                    }
                }
            }

            index += 1;
        }
    }
}

/// Marks runtime frames adjacent to Java frames.
fn mark_art_frames( tree: &ThreadTree, callchain: &mut [CallChainReportEntry] ) {
    let mut near_java_method = false;
    for index in 0..callchain.len() {
        let is_art = is_art_library( tree.dso( callchain[ index ].dso ).path() );
        match callchain[ index ].execution_type {
            CallChainExecutionType::InterpretedJvm | CallChainExecutionType::JitJvm | CallChainExecutionType::ArtJni => {
                near_java_method = true;
                for previous in callchain[ ..index ].iter_mut().rev() {
                    if previous.execution_type != CallChainExecutionType::Native || !is_art_library( tree.dso( previous.dso ).path() ) {
                        break;
                    }

                    previous.execution_type = CallChainExecutionType::ArtMethod;
                }
            },
            CallChainExecutionType::Native if near_java_method && is_art => {
                callchain[ index ].execution_type = CallChainExecutionType::ArtMethod;
            },
            CallChainExecutionType::ArtMethod => {},
            _ => {
                near_java_method = false;
            }
        }
    }
}
